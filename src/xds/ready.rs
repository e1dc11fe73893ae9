//! The xDS server's one-shot ready signal (SPEC_FULL.md §4.C).
//!
//! Tripped exactly once, on the first incoming stream or fetch request from
//! any Envoy node. `report()` lets startup code block on it so the discovery
//! controller doesn't start reconciling before the snapshot engine has
//! learned a node id to publish under.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct ReadySignal {
    tripped: AtomicBool,
    notify: Notify,
    node_id: RwLock<Option<String>>,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal if this is the first call; later calls are a no-op.
    /// Returns whether this call was the one that tripped it.
    pub fn trip(&self) -> bool {
        self.trip_with(None)
    }

    /// Trip the signal, recording the connecting Envoy's node id if this is
    /// the call that tripped it. Later calls (from later requests, or from
    /// other streams racing the first one) are a no-op regardless of node id.
    pub fn trip_with(&self, node_id: Option<String>) -> bool {
        if self.tripped.swap(true, Ordering::AcqRel) {
            false
        } else {
            *self.node_id.write().expect("node id lock poisoned") = node_id;
            self.notify.notify_waiters();
            true
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// The node id captured by the trip that closed this signal, if the
    /// first request carried one.
    pub fn node_id(&self) -> Option<String> {
        self.node_id.read().expect("node id lock poisoned").clone()
    }

    /// Block until the signal is tripped (`report()` in SPEC_FULL.md §4.C).
    pub async fn report(&self) {
        if self.is_tripped() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_tripped() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn report_returns_immediately_once_tripped() {
        let signal = ReadySignal::new();
        signal.trip();
        tokio::time::timeout(std::time::Duration::from_millis(50), signal.report()).await.unwrap();
    }

    #[tokio::test]
    async fn report_blocks_until_tripped() {
        let signal = Arc::new(ReadySignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.report().await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.trip();
        tokio::time::timeout(std::time::Duration::from_millis(50), waiter).await.unwrap().unwrap();
    }

    #[test]
    fn trip_is_idempotent() {
        let signal = ReadySignal::new();
        assert!(signal.trip());
        assert!(!signal.trip());
    }
}
