//! Client configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`sideline.toml` and friends)
//! - Environment variables (`SIDELINE__SECTION__KEY`, e.g.
//!   `SIDELINE__CHANNEL__KEEPALIVE_MS=15000`)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sideline_core::{CadenceParams, TrackerConfig};
use sideline_protocol::Identity;
use sideline_transport::WebSocketConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::ChannelConfig;
use crate::dispatch::DispatchOptions;

const CONFIG_PATHS: [&str; 3] = [
    "sideline.toml",
    "/etc/sideline/sideline.toml",
    "~/.config/sideline/sideline.toml",
];

const ENV_PREFIX: &str = "SIDELINE";

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Identity to connect as. Normally supplied by the login flow.
    #[serde(default)]
    pub identity: Option<Identity>,

    /// Alert service endpoints.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Channel timing.
    #[serde(default)]
    pub channel: ChannelSection,

    /// Session tracking policy.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// CPR cadence parameters.
    #[serde(default)]
    pub cadence: CadenceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Alert service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// WebSocket base URLs, most preferred first. The identity path
    /// (`/{id}/{role}`) is appended to each.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Channel timing, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    #[serde(default = "default_keepalive")]
    pub keepalive_ms: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,

    /// 1.0 keeps the reconnect delay fixed.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// CPR cadence parameters, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default = "default_compression_interval")]
    pub compression_interval_ms: u64,

    #[serde(default = "default_compressions_per_cycle")]
    pub compressions_per_cycle: u32,

    #[serde(default = "default_breaths_per_cycle")]
    pub breaths_per_cycle: u32,

    #[serde(default = "default_breath_duration")]
    pub breath_duration_ms: u64,

    #[serde(default = "default_breath_lead_in")]
    pub breath_lead_in_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_endpoints() -> Vec<String> {
    vec!["ws://localhost:8000/api/emergency-alerts/ws".to_string()]
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_keepalive() -> u64 {
    30_000 // 30 seconds
}

fn default_reconnect_delay() -> u64 {
    5_000
}

fn default_reconnect_max_delay() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_compression_interval() -> u64 {
    600 // 100 per minute
}

fn default_compressions_per_cycle() -> u32 {
    30
}

fn default_breaths_per_cycle() -> u32 {
    2
}

fn default_breath_duration() -> u64 {
    1_000
}

fn default_breath_lead_in() -> u64 {
    1_000
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            keepalive_ms: default_keepalive(),
            reconnect_delay_ms: default_reconnect_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            compression_interval_ms: default_compression_interval(),
            compressions_per_cycle: default_compressions_per_cycle(),
            breaths_per_cycle: default_breaths_per_cycle(),
            breath_duration_ms: default_breath_duration(),
            breath_lead_in_ms: default_breath_lead_in(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl From<&ChannelSection> for ChannelConfig {
    fn from(section: &ChannelSection) -> Self {
        Self {
            keepalive_interval: Duration::from_millis(section.keepalive_ms),
            reconnect_delay: Duration::from_millis(section.reconnect_delay_ms),
            reconnect_max_delay: Duration::from_millis(section.reconnect_max_delay_ms),
            backoff_multiplier: section.backoff_multiplier,
        }
    }
}

impl From<&CadenceConfig> for CadenceParams {
    fn from(config: &CadenceConfig) -> Self {
        Self {
            compression_interval: Duration::from_millis(config.compression_interval_ms),
            compressions_per_cycle: config.compressions_per_cycle,
            breaths_per_cycle: config.breaths_per_cycle,
            breath_duration: Duration::from_millis(config.breath_duration_ms),
            breath_lead_in: Duration::from_millis(config.breath_lead_in_ms),
        }
    }
}

impl ClientConfig {
    /// Load configuration from the first default path that exists, with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file or environment cannot be parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::find_file().as_deref())
    }

    /// Load configuration from `path` (if any) with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file or environment cannot be parsed,
    /// or the result is invalid.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        Self::layered(path, None)
    }

    /// First default config path that exists.
    #[must_use]
    pub fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    fn layered(path: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("service.endpoints")
                .try_parsing(true)
                .source(env),
        );

        let source = match path {
            Some(path) => format!("config file {}", path.display()),
            None => "environment".to_string(),
        };
        let config: Self = builder
            .build()
            .with_context(|| format!("Failed to read {}", source))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse {}", source))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the client misbehave.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.service.endpoints.is_empty() {
            bail!("service.endpoints must list at least one endpoint");
        }
        if self.channel.keepalive_ms == 0 {
            bail!("channel.keepalive_ms must be positive");
        }
        if !self.channel.backoff_multiplier.is_finite() || self.channel.backoff_multiplier < 1.0 {
            bail!("channel.backoff_multiplier must be at least 1.0");
        }
        if self.cadence.compression_interval_ms == 0 || self.cadence.compressions_per_cycle == 0 {
            bail!("cadence compression settings must be positive");
        }
        Ok(())
    }

    /// WebSocket settings shared by every endpoint.
    #[must_use]
    pub fn websocket_template(&self) -> WebSocketConfig {
        WebSocketConfig {
            connect_timeout: Duration::from_millis(self.service.connect_timeout_ms),
            ..Default::default()
        }
    }

    /// Settings for a [`Dispatcher`](crate::Dispatcher).
    #[must_use]
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            channel: ChannelConfig::from(&self.channel),
            tracker: self.tracker.clone(),
            cadence: CadenceParams::from(&self.cadence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sideline_core::TrackerPolicy;
    use sideline_protocol::Role;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.identity.is_none());
        assert_eq!(config.service.endpoints.len(), 1);
        assert_eq!(config.channel.keepalive_ms, 30_000);
        assert_eq!(config.tracker.policy, TrackerPolicy::Retain);
        assert!(!config.metrics.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_dispatch_options_match_defaults() {
        let options = ClientConfig::default().dispatch_options();
        assert_eq!(options.channel, ChannelConfig::default());
        assert_eq!(options.cadence, CadenceParams::default());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [identity]
            id = "7"
            role = "coach"

            [service]
            endpoints = ["ws://192.168.5.247:8000/api/emergency-alerts/ws", "ws://localhost:8000/api/emergency-alerts/ws"]

            [channel]
            reconnect_delay_ms = 2000
            backoff_multiplier = 2.0

            [tracker]
            policy = "replace"
            dedupe_responders = true
        "#;

        let config: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.identity, Some(Identity::new("7", Role::Coach)));
        assert_eq!(config.service.endpoints.len(), 2);
        assert_eq!(config.channel.reconnect_delay_ms, 2000);
        assert_eq!(config.channel.keepalive_ms, 30_000);
        assert_eq!(config.tracker.policy, TrackerPolicy::Replace);
        assert!(config.tracker.dedupe_responders);
        assert_eq!(config.cadence.compressions_per_cycle, 30);
    }

    #[test]
    fn test_environment_overrides() {
        let env = config::Map::from([
            ("SIDELINE__CHANNEL__KEEPALIVE_MS".to_string(), "15000".to_string()),
            ("SIDELINE__IDENTITY__ID".to_string(), "42".to_string()),
            ("SIDELINE__IDENTITY__ROLE".to_string(), "athlete".to_string()),
            (
                "SIDELINE__SERVICE__ENDPOINTS".to_string(),
                "ws://a/ws,ws://b/ws".to_string(),
            ),
        ]);

        let config = ClientConfig::layered(None, Some(env)).unwrap();
        assert_eq!(config.channel.keepalive_ms, 15_000);
        assert_eq!(config.identity, Some(Identity::new("42", Role::Athlete)));
        assert_eq!(config.service.endpoints, vec!["ws://a/ws", "ws://b/ws"]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.service.endpoints.clear();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.channel.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }
}
