//! Client configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`tether.toml`)
//! - Environment variables (`TETHER_*`, nested keys joined with `__`)
//! - Command line arguments, applied by `main`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tether_core::ClientOptions;

/// CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection options.
    #[serde(default)]
    pub client: ClientOptions,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

const CONFIG_PATHS: [&str; 3] = [
    "tether.toml",
    "/etc/tether/tether.toml",
    "~/.config/tether/tether.toml",
];

impl Config {
    /// Load configuration from `path`, or the first default path that
    /// exists, then apply `TETHER_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        base.with_env(None)
    }

    fn default_path() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .find(|p| p.exists())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Layer environment overrides on top of this configuration.
    ///
    /// `env` replaces the process environment, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be converted.
    pub fn with_env(self, env: Option<HashMap<String, String>>) -> Result<Self> {
        let environment = config::Environment::with_prefix("TETHER")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("client.fallback_hosts")
            .with_list_parse_key("client.transports")
            .source(env);

        config::Config::builder()
            .add_source(config::Config::try_from(&self).context("Invalid base configuration")?)
            .add_source(environment)
            .build()
            .context("Failed to apply environment overrides")?
            .try_deserialize()
            .context("Invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_transport::TransportKind;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.realtime_host, "realtime.tether.io");
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [client]
            key = "app.key:secret"
            client_id = "cli"
            fallback_hosts = ["a.tether.io", "b.tether.io"]
            transports = ["comet_stream"]

            [client.timeouts]
            realtime_request_timeout_ms = 5000

            [metrics]
            enabled = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client.key.as_deref(), Some("app.key:secret"));
        assert_eq!(config.client.fallback_hosts.len(), 2);
        assert_eq!(config.client.transports, [TransportKind::CometStream]);
        assert_eq!(config.client.timeouts.realtime_request_timeout_ms, 5000);
        assert_eq!(config.client.timeouts.connection_state_ttl_ms, 120_000);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("TETHER_CLIENT__CLIENT_ID".to_string(), "from-env".to_string()),
            ("TETHER_CLIENT__PORT".to_string(), "8080".to_string()),
            ("TETHER_METRICS__ENABLED".to_string(), "true".to_string()),
        ]);
        let config = Config::default().with_env(Some(env)).unwrap();
        assert_eq!(config.client.client_id.as_deref(), Some("from-env"));
        assert_eq!(config.client.port, 8080);
        assert!(config.metrics.enabled);
        assert_eq!(config.client.realtime_host, "realtime.tether.io");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::from_file("/nonexistent/tether.toml").is_err());
    }
}
