//! Tunnel data-plane configuration.
//!
//! Injected as plain values by the surrounding router; every field has a
//! default so an empty TOML table is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::{FULL_SIZE, MAX_DEFRAGMENT_TIME_MS};

/// Complete tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Gateway batching policy.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Gateway pump threads. 0 pumps inline on the calling thread.
    #[serde(default = "default_pump_threads")]
    pub pump_threads: usize,
    /// How long a partial message waits for missing fragments.
    #[serde(default = "default_max_defragment_time")]
    pub max_defragment_time_ms: u64,
    /// Messages a single gateway may hold before dropping new ones.
    #[serde(default = "default_gateway_queue_limit")]
    pub gateway_queue_limit: usize,
    /// Share-bandwidth admission control.
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
    /// Routing misses log quietly for this long after startup.
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,
}

/// Batching policy for gateway preprocessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Use the batched preprocessor. `false` selects the trivial one.
    #[serde(default = "default_true")]
    pub use_batching: bool,
    /// Longest a partial cell may wait for more messages.
    #[serde(default = "default_batch_delay")]
    pub delay_ms: u64,
    /// Flush once more than this many messages are queued.
    #[serde(default = "default_force_send_threshold")]
    pub force_send_threshold: usize,
    /// Flush once the pending bytes reach this share of a cell.
    #[serde(default = "default_full_enough_percent")]
    pub full_enough_percent: u8,
}

/// Share-bandwidth budget for traffic in tunnels we did not create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Outbound bandwidth limit in KBps. 0 disables admission control.
    #[serde(default)]
    pub share_kbps: u32,
    /// Share of the limit offered to participating tunnels.
    #[serde(default = "default_share_percentage")]
    pub share_percentage: u8,
    /// Averaging window for measured participating bandwidth.
    #[serde(default = "default_measure_window")]
    pub measure_window_secs: u64,
}

// Default value functions

fn default_pump_threads() -> usize {
    4
}

fn default_max_defragment_time() -> u64 {
    MAX_DEFRAGMENT_TIME_MS
}

fn default_gateway_queue_limit() -> usize {
    2048
}

fn default_startup_grace() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_batch_delay() -> u64 {
    100
}

fn default_force_send_threshold() -> usize {
    5
}

fn default_full_enough_percent() -> u8 {
    80
}

fn default_share_percentage() -> u8 {
    80
}

fn default_measure_window() -> u64 {
    10
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            pump_threads: default_pump_threads(),
            max_defragment_time_ms: default_max_defragment_time(),
            gateway_queue_limit: default_gateway_queue_limit(),
            bandwidth: BandwidthConfig::default(),
            startup_grace_secs: default_startup_grace(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            use_batching: true,
            delay_ms: default_batch_delay(),
            force_send_threshold: default_force_send_threshold(),
            full_enough_percent: default_full_enough_percent(),
        }
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            share_kbps: 0,
            share_percentage: default_share_percentage(),
            measure_window_secs: default_measure_window(),
        }
    }
}

impl BatchConfig {
    /// Pending bytes at which a partial cell is sent without waiting.
    pub fn full_enough_size(&self) -> usize {
        FULL_SIZE * usize::from(self.full_enough_percent.min(100)) / 100
    }
}

impl BandwidthConfig {
    /// Participating budget in bytes per second, or `None` when unlimited.
    pub fn share_budget_bps(&self) -> Option<f64> {
        if self.share_kbps == 0 {
            return None;
        }
        let pct = f64::from(self.share_percentage.min(100)) / 100.0;
        Some(f64::from(self.share_kbps) * 1024.0 * pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.pump_threads, 4);
        assert!(config.batch.use_batching);
        assert_eq!(config.batch.delay_ms, 100);
        assert_eq!(config.batch.force_send_threshold, 5);
        assert_eq!(config.batch.full_enough_size(), 802);
        assert_eq!(config.max_defragment_time_ms, 60_000);
        assert_eq!(config.bandwidth.share_budget_bps(), None);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: TunnelConfig = toml::from_str("").expect("parse");
        assert_eq!(config.gateway_queue_limit, 2048);
        assert_eq!(config.startup_grace_secs, 600);
    }

    #[test]
    fn test_partial_toml() {
        let config: TunnelConfig = toml::from_str(
            r#"
            pump_threads = 2

            [batch]
            delay_ms = 250

            [bandwidth]
            share_kbps = 100
            share_percentage = 50
            "#,
        )
        .expect("parse");
        assert_eq!(config.pump_threads, 2);
        assert_eq!(config.batch.delay_ms, 250);
        assert_eq!(config.batch.force_send_threshold, 5);
        assert_eq!(config.bandwidth.share_budget_bps(), Some(51_200.0));
    }

    #[test]
    fn test_config_serialization() {
        let config = TunnelConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let _parsed: TunnelConfig = toml::from_str(&toml_str).expect("parse");
    }
}
