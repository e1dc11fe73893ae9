//! A rate-limited, deduplicating work queue, modeled on `client-go`'s
//! `workqueue.RateLimitingInterface` the way the original implementation's
//! `pkg/discovery/kubernetes.go` uses it: one key per changed object, no
//! duplicate processing of the same key while it's already queued, and a
//! 5-retry exponential-backoff cap before a key is dropped.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(250);

struct Inner {
    dirty: HashSet<String>,
    retries: std::collections::HashMap<String, u32>,
}

/// A FIFO queue of string keys (`namespace/name`) with de-dup while pending
/// and rate-limited re-adds on error.
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<String>,
    inner: Mutex<Inner>,
}

impl WorkQueue {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                tx,
                inner: Mutex::new(Inner { dirty: HashSet::new(), retries: Default::default() }),
            }),
            rx,
        )
    }

    /// Enqueue `key`. A key already pending is not added twice.
    pub fn add(&self, key: String) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        if !inner.dirty.insert(key.clone()) {
            return;
        }
        let _ = self.tx.send(key);
    }

    /// Mark `key` as no longer in-flight so a later `add` for it isn't
    /// silently dropped as a duplicate, and forget its retry count.
    pub fn forget(&self, key: &str) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        inner.dirty.remove(key);
        inner.retries.remove(key);
    }

    /// Handle a processing error for `key`: re-add with exponential backoff
    /// up to `MAX_RETRIES`, after which the key is dropped and a warning logged.
    pub fn handle_err(self: &std::sync::Arc<Self>, key: String, error: &crate::errors::GatewayError) {
        let retries = {
            let mut inner = self.inner.lock().expect("work queue lock poisoned");
            inner.dirty.remove(&key);
            let count = inner.retries.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if retries > MAX_RETRIES {
            warn!(key = %key, %error, retries, "dropping key out of the work queue after exhausting retries");
            self.inner.lock().expect("work queue lock poisoned").retries.remove(&key);
            return;
        }

        let backoff = BASE_BACKOFF * 2u32.pow(retries.saturating_sub(1));
        info!(key = %key, %error, retries, backoff_ms = backoff.as_millis() as u64, "requeueing after error");

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            queue.add(key);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_add_is_collapsed() {
        let (queue, mut rx) = WorkQueue::new();
        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());
        assert_eq!(rx.recv().await, Some("ns/a".to_string()));

        // Drain shouldn't have a second entry queued.
        tokio::time::timeout(Duration::from_millis(20), rx.recv()).await.unwrap_err();
    }

    #[tokio::test]
    async fn forget_allows_requeue() {
        let (queue, mut rx) = WorkQueue::new();
        queue.add("ns/a".to_string());
        rx.recv().await;
        queue.forget("ns/a");
        queue.add("ns/a".to_string());
        assert_eq!(rx.recv().await, Some("ns/a".to_string()));
    }

    #[tokio::test]
    async fn handle_err_drops_key_after_max_retries() {
        let (queue, _rx) = WorkQueue::new();
        let error = crate::errors::GatewayError::reconcile("boom");

        for _ in 0..MAX_RETRIES {
            queue.handle_err("ns/a".to_string(), &error);
        }
        assert!(queue.inner.lock().unwrap().retries.contains_key("ns/a"));

        // One more failure exceeds the cap: the retry count is cleared.
        queue.handle_err("ns/a".to_string(), &error);
        assert!(!queue.inner.lock().unwrap().retries.contains_key("ns/a"));
    }
}
