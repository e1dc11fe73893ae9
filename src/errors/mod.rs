//! # Error Handling
//!
//! Typed errors for the control plane, using `thiserror`. Every variant carries the
//! context a log line needs without the caller having to re-derive it.

/// Result type for control-plane operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// Configuration errors: missing/invalid settings, bad CLI flag combinations.
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Kubernetes client/API errors (watch, list, get, create, update).
    #[error("kubernetes error: {context}")]
    Kubernetes {
        #[source]
        source: kube::Error,
        context: String,
    },

    /// xDS protocol / snapshot engine errors, including `NO_NODE` and `INCONSISTENT`.
    #[error("xDS error: {message}")]
    Xds { message: String, node_id: Option<String> },

    /// gRPC transport errors (bind failure, TLS configuration).
    #[error("transport error: {0}")]
    Transport(String),

    /// Object projection/validation errors (malformed annotation, missing port).
    #[error("validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Virtual-node reconciler errors, including exhausted conflict retries.
    #[error("reconcile error: {message}")]
    Reconcile { message: String },

    /// Resource not found (used by the reconciler's get-before-update path).
    #[error("not found: {resource_type} '{id}'")]
    NotFound { resource_type: String, id: String },

    /// Catch-all for unexpected internal failures.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl GatewayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    pub fn kubernetes<S: Into<String>>(source: kube::Error, context: S) -> Self {
        Self::Kubernetes { source, context: context.into() }
    }

    pub fn xds<S: Into<String>>(message: S) -> Self {
        Self::Xds { message: message.into(), node_id: None }
    }

    pub fn xds_with_node<S: Into<String>, N: Into<String>>(message: S, node_id: N) -> Self {
        Self::Xds { message: message.into(), node_id: Some(node_id.into()) }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    pub fn reconcile<S: Into<String>>(message: S) -> Self {
        Self::Reconcile { message: message.into() }
    }

    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Whether this condition should be treated as retryable by the work queue /
    /// periodic resync, per the taxonomy in SPEC_FULL.md §7.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Xds { .. } => true,
            GatewayError::Kubernetes { .. } => true,
            GatewayError::Reconcile { .. } => true,
            GatewayError::Validation { .. } | GatewayError::NotFound { .. } => false,
            GatewayError::Config { .. } | GatewayError::Transport(_) | GatewayError::Internal { .. } => false,
        }
    }
}

impl From<kube::Error> for GatewayError {
    fn from(error: kube::Error) -> Self {
        Self::Kubernetes { source: error, context: "kubernetes client operation failed".to_string() }
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");
        Self::validation(format!("validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_displays_message() {
        let error = GatewayError::config("bad port");
        assert!(matches!(error, GatewayError::Config { .. }));
        assert_eq!(error.to_string(), "configuration error: bad port");
    }

    #[test]
    fn xds_error_retains_node_id() {
        let error = GatewayError::xds_with_node("no node connected", "envoy-1");
        if let GatewayError::Xds { node_id, .. } = error {
            assert_eq!(node_id, Some("envoy-1".to_string()));
        } else {
            panic!("expected Xds variant");
        }
    }

    #[test]
    fn retryable_classification_matches_taxonomy() {
        assert!(GatewayError::xds("no node").is_retryable());
        assert!(!GatewayError::validation("bad annotation").is_retryable());
        assert!(!GatewayError::config("bad port").is_retryable());
        assert!(!GatewayError::not_found("VirtualNode", "gw").is_retryable());
    }
}
