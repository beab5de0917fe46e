//! Gateway configuration module
//!
//! Handles loading and parsing of gateway configuration from a toml
//! file and environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Gateway name used in logs
    #[serde(default = "default_name")]
    pub name: String,

    /// Listen address for the WebSocket gateway
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,

    /// Maximum inbound logical message size in bytes
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: u32,

    /// Tick interval in milliseconds for the processing driver
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Codec pool capacity (0 disables pooling)
    #[serde(default = "default_codec_pool_size")]
    pub codec_pool_size: usize,

    /// Client reconnect backoff in seconds
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u32,
}

// Default value functions
fn default_name() -> String {
    "tickgate".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:9460".to_string()
}

fn default_max_sessions() -> u32 {
    4096
}

fn default_max_msg_size() -> u32 {
    65536
}

fn default_tick_interval() -> u64 {
    1
}

fn default_codec_pool_size() -> usize {
    64
}

fn default_reconnect_secs() -> u32 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/gateway.toml"),
            name: default_name(),
            listen_addr: default_listen_addr(),
            max_sessions: default_max_sessions(),
            max_msg_size: default_max_msg_size(),
            tick_interval_ms: default_tick_interval(),
            codec_pool_size: default_codec_pool_size(),
            reconnect_secs: default_reconnect_secs(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("TICKGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/gateway.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TICKGATE_NAME") {
            self.name = val;
        }
        if let Ok(val) = env::var("TICKGATE_LISTEN_ADDR") {
            self.listen_addr = val;
        }
        if let Ok(val) = env::var("TICKGATE_MAX_SESSIONS") {
            if let Ok(parsed) = val.parse() {
                self.max_sessions = parsed;
            }
        }
        if let Ok(val) = env::var("TICKGATE_MAX_MSG_SIZE") {
            if let Ok(parsed) = val.parse() {
                self.max_msg_size = parsed;
            }
        }
        if let Ok(val) = env::var("TICKGATE_TICK_INTERVAL_MS") {
            if let Ok(parsed) = val.parse() {
                self.tick_interval_ms = parsed;
            }
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("Invalid listen address: {}", self.listen_addr);
        }
        if self.max_sessions == 0 {
            anyhow::bail!("max_sessions must be at least 1");
        }
        if self.max_msg_size == 0 {
            anyhow::bail!("max_msg_size must be at least 1");
        }
        if self.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let config = GatewayConfig {
            listen_addr: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sessions_rejected() {
        let config = GatewayConfig {
            max_sessions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: GatewayConfig =
            toml::from_str("listen_addr = \"127.0.0.1:9000\"\nmax_sessions = 16\n").unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.max_sessions, 16);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.max_msg_size, default_max_msg_size());
        assert_eq!(config.tick_interval_ms, default_tick_interval());
    }
}
