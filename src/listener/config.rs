//! Listener configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default UDP port the station hub broadcasts on.
pub const DEFAULT_PREFERRED_PORT: u16 = 50222;

/// UDP ingestion listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Local address to bind.
    pub bind_address: String,
    /// Port tried first unless the preferred-port setting is overridden locally.
    pub preferred_port: u16,
    /// Bind attempts on the preferred port before sweeping (first try included).
    pub bind_attempts: u32,
    /// Delay between same-port bind attempts in milliseconds.
    pub bind_retry_delay_ms: u64,
    /// Number of ports after the preferred port to try.
    pub port_sweep: u16,
    /// Upper bound on one receive call in milliseconds.
    pub receive_timeout_ms: u64,
    /// Silence duration before warning, and the minimum gap between warnings.
    pub silence_warning_secs: u64,
    /// Delay after a receive error in milliseconds.
    pub error_delay_ms: u64,
    /// Delay after `error_threshold` consecutive errors in milliseconds.
    pub error_backoff_ms: u64,
    /// Consecutive errors before switching to the long backoff.
    pub error_threshold: u32,
    /// Bound on each disposal step in milliseconds.
    pub dispose_timeout_ms: u64,
    /// Seconds between connectivity probes (0 disables network monitoring).
    pub network_probe_interval_secs: u64,
    /// Address the connectivity probe routes towards. No traffic is sent.
    pub network_probe_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            preferred_port: DEFAULT_PREFERRED_PORT,
            bind_attempts: 3,
            bind_retry_delay_ms: 500,
            port_sweep: 10,
            receive_timeout_ms: 1000,
            silence_warning_secs: 60,
            error_delay_ms: 100,
            error_backoff_ms: 5000,
            error_threshold: 10,
            dispose_timeout_ms: 5000,
            network_probe_interval_secs: 10,
            network_probe_address: "8.8.8.8:53".to_string(),
        }
    }
}

impl ListenerConfig {
    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_delay_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn silence_window(&self) -> Duration {
        Duration::from_secs(self.silence_warning_secs)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_timeout_ms)
    }

    pub fn network_probe_interval(&self) -> Option<Duration> {
        (self.network_probe_interval_secs > 0)
            .then(|| Duration::from_secs(self.network_probe_interval_secs))
    }
}
