//! Relay configuration.
//!
//! Read from the first `sideline-relay.toml` found in the working directory,
//! `/etc/sideline` or `~/.config/sideline`, then overridden by
//! `SIDELINE_RELAY__*` variables (e.g. `SIDELINE_RELAY__METRICS__PORT=9100`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const CONFIG_PATHS: [&str; 3] = [
    "sideline-relay.toml",
    "/etc/sideline/sideline-relay.toml",
    "~/.config/sideline/sideline-relay.toml",
];

const ENV_PREFIX: &str = "SIDELINE_RELAY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    /// Devices dial `ws://host:port/api/emergency-alerts/ws/{id}/{role}`.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest WebSocket message accepted from a device, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub metrics: MetricsSection,
}

/// `[metrics]`: Prometheus exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8000
}

fn default_max_message_size() -> usize {
    sideline_protocol::codec::MAX_FRAME_SIZE
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_message_size: default_max_message_size(),
            metrics: MetricsSection::default(),
        }
    }
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load from the default locations plus the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or does not match the
    /// expected shape.
    pub fn load() -> Result<Self> {
        let found = CONFIG_PATHS
            .iter()
            .map(|candidate| PathBuf::from(shellexpand::tilde(candidate).as_ref()))
            .find(|candidate| candidate.is_file());
        Self::layered(found.as_deref(), None)
    }

    /// Load from an explicit file plus the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is missing or does not match the expected
    /// shape.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("Config file {} not found", path.display());
        }
        Self::layered(Some(path), None)
    }

    fn layered(file: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to read relay configuration")?;

        settings.try_deserialize().with_context(|| match file {
            Some(file) => format!("Invalid relay configuration in {}", file.display()),
            None => "Invalid relay configuration".to_string(),
        })
    }

    /// Listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .host
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("Invalid host {:?}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().to_string(), "0.0.0.0:8000");
        assert_eq!(config.max_message_size, 64 * 1024);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            host = "127.0.0.1"

            [metrics]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:8000");
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);
    }

    #[test]
    fn test_environment_overrides() {
        let env = config::Map::from([
            ("SIDELINE_RELAY__PORT".to_string(), "8100".to_string()),
            ("SIDELINE_RELAY__METRICS__ENABLED".to_string(), "true".to_string()),
        ]);
        let config = Config::layered(None, Some(env)).unwrap();
        assert_eq!(config.port, 8100);
        assert!(config.metrics.enabled);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_load_from_explicit_file() {
        let path = std::env::temp_dir().join(format!("sideline-relay-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 8200\nmax_message_size = 4096\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 8200);
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = Config::load_from(Path::new("/nonexistent/sideline-relay.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_hostname_is_rejected() {
        let config = Config {
            host: "stadium.local".into(),
            ..Default::default()
        };
        assert!(config.bind_addr().is_err());
    }
}
