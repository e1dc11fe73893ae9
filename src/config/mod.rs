//! # Configuration Management
//!
//! Layered configuration: compiled defaults, an optional config file, then
//! environment variables, with CLI flags (parsed separately in [`crate::cli`])
//! applied last on top since they are the most specific statement of operator
//! intent. See SPEC_FULL.md §4.H.

use crate::errors::{GatewayError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

const ENV_PREFIX: &str = "XDS_GATEWAY";

/// Top-level, file/env-loadable configuration. Most CLI flags (discovery
/// mode, `--opt-in`, `--namespace`, kubeconfig selection) are layered on top
/// of this by [`crate::cli::Cli::into_settings`] and not duplicated here
/// because they have no sensible value outside of an invocation; `--ads` is
/// the exception, kept on `Settings` since it is logged at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Settings {
    #[validate(nested)]
    pub xds: XdsSettings,

    /// Annotation key prefix consumed by both source projectors (§6).
    #[validate(length(min = 1, message = "annotation prefix cannot be empty"))]
    pub annotation_prefix: String,

    /// Worker task count for the discovery controller's work queue (§4.E).
    #[validate(range(min = 1, max = 64, message = "worker count must be between 1 and 64"))]
    pub workers: usize,

    /// Periodic full-resync interval in seconds (default 300s = 5m, §4.E).
    #[validate(range(min = 1, message = "resync interval must be positive"))]
    pub resync_interval_seconds: u64,

    /// Forces all Envoy resources to be explicitly named in the request
    /// before they are served (§4.G `--ads`/`-a`). Informational here: the
    /// xDS server always restricts a response to `resource_names` when the
    /// request carries any, regardless of this flag, which is a strict
    /// superset of what the flag asks for and also leaves eager (non-ADS)
    /// clients unaffected since they never populate `resource_names`.
    pub ads: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            xds: XdsSettings::default(),
            annotation_prefix: "gateway.appmesh.k8s.aws".to_string(),
            workers: 2,
            resync_interval_seconds: 300,
            ads: false,
        }
    }
}

impl Settings {
    pub fn validate_all(&self) -> Result<()> {
        Validate::validate(self).map_err(GatewayError::from)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct XdsSettings {
    #[validate(length(min = 1, message = "xDS host cannot be empty"))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "xDS port must be between 1 and 65535"))]
    pub port: u16,

    #[validate(range(min = 1, message = "max concurrent streams must be positive"))]
    pub max_concurrent_streams: u32,
}

impl Default for XdsSettings {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 18000, max_concurrent_streams: 1_000_000 }
    }
}

impl XdsSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Load configuration in the order: defaults → optional file → environment
/// (`XDS_GATEWAY__` prefix, double-underscore separated for nested fields).
pub fn load_settings<P: AsRef<Path>>(config_path: Option<P>) -> Result<Settings> {
    let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

    if let Some(path) = config_path {
        let path = path.as_ref();
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(GatewayError::config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true));

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;
    settings.validate_all()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate_all().is_ok());
        assert_eq!(settings.xds.bind_address(), "0.0.0.0:18000");
    }

    #[test]
    fn file_overrides_defaults() {
        let yaml = "xds:\n  port: 19000\nworkers: 4\n";
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let settings = load_settings(Some(file.path())).unwrap();
        assert_eq!(settings.xds.port, 19000);
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.annotation_prefix, "gateway.appmesh.k8s.aws");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = load_settings(Some("/nonexistent/xds-gateway.yaml"));
        assert!(result.is_err());
    }
}
