//! Configuration file management.

use std::path::PathBuf;

use hopnet_tunnel::config::TunnelConfig;
use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Tunnel data-plane settings, shared by every simulated router.
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// In-process network settings.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level for hopnet crates: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Shape of the simulated network and its traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Routers in the network.
    #[serde(default = "default_routers")]
    pub routers: usize,
    /// Hops per tunnel besides the creator.
    #[serde(default = "default_hops")]
    pub hops: usize,
    /// Messages sent from outbound tunnels into inbound tunnels.
    #[serde(default = "default_messages")]
    pub messages: usize,
    /// Largest random message payload in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// How long to wait for deliveries before reporting.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_routers() -> usize {
    6
}

fn default_hops() -> usize {
    2
}

fn default_messages() -> usize {
    200
}

fn default_max_message_size() -> usize {
    4096
}

fn default_settle_ms() -> u64 {
    3000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            routers: default_routers(),
            hops: default_hops(),
            messages: default_messages(),
            max_message_size: default_max_message_size(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `$HOPNET_CONFIG`, or `config.toml` in the
    /// working directory.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings the simulation cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let sim = &self.simulation;
        if sim.routers < sim.hops + 2 {
            anyhow::bail!(
                "{} routers cannot host {}-hop tunnels between distinct routers",
                sim.routers,
                sim.hops
            );
        }
        if sim.routers > usize::from(u8::MAX) {
            anyhow::bail!("at most {} routers", u8::MAX);
        }
        if sim.max_message_size > hopnet_tunnel::MAX_MESSAGE_SIZE - 16 {
            anyhow::bail!("max_message_size {} exceeds the tunnel limit", sim.max_message_size);
        }
        Ok(())
    }

    fn config_path() -> PathBuf {
        match std::env::var("HOPNET_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => PathBuf::from("config.toml"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.simulation.routers, 6);
        assert_eq!(config.tunnel.pump_threads, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.simulation.messages, config.simulation.messages);
    }

    #[test]
    fn test_partial_file() {
        let parsed: DaemonConfig = toml::from_str(
            "[simulation]\nrouters = 3\nhops = 1\n\n[tunnel.batch]\nuse_batching = false\n",
        )
        .expect("parse");
        assert_eq!(parsed.simulation.routers, 3);
        assert_eq!(parsed.simulation.messages, 200);
        assert!(!parsed.tunnel.batch.use_batching);
        assert_eq!(parsed.tunnel.gateway_queue_limit, 2048);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_too_few_routers() {
        let mut config = DaemonConfig::default();
        config.simulation.routers = 3;
        config.simulation.hops = 2;
        assert!(config.validate().is_err());
    }
}
