//! Rollup worker configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::config::APP_DIR_NAME;

/// Default raw-reading table.
pub const DEFAULT_SOURCE_TABLE: &str = "observations";
/// Default database file inside the application data dir.
pub const DEFAULT_DATABASE_FILE: &str = "rollup.db";

/// Aggregation window width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketWidth {
    Hour,
    Day,
}

impl BucketWidth {
    pub fn seconds(&self) -> i64 {
        match self {
            BucketWidth::Hour => 3_600,
            BucketWidth::Day => 86_400,
        }
    }

    /// Output table holding buckets of this width.
    pub fn table(&self) -> &'static str {
        match self {
            BucketWidth::Hour => "observation_rollup_hourly",
            BucketWidth::Day => "observation_rollup_daily",
        }
    }

    /// Stored in the watermark key.
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketWidth::Hour => "hour",
            BucketWidth::Day => "day",
        }
    }
}

impl fmt::Display for BucketWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rollup worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    /// Turn the worker off entirely.
    pub enabled: bool,
    /// SQLite URL or path. Defaults to the application data dir.
    pub database_url: Option<String>,
    /// Append-only raw-reading table.
    pub source_table: String,
    /// Restrict rollup to these installations. Empty means all.
    pub installation_ids: Vec<String>,
    pub tick_interval_secs: u64,
    /// Seconds between reconnection probes while degraded.
    pub reconnect_interval_secs: u64,
    /// Upper bound on buckets processed per width per tick.
    pub max_buckets_per_tick: u32,
    pub bucket_widths: Vec<BucketWidth>,
    pub busy_timeout_ms: u64,
    pub max_connections: u32,
    /// Bound on waiting for timers to stop during dispose.
    pub dispose_timeout_ms: u64,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: None,
            source_table: DEFAULT_SOURCE_TABLE.to_string(),
            installation_ids: Vec::new(),
            tick_interval_secs: 60,
            reconnect_interval_secs: 30,
            max_buckets_per_tick: 48,
            bucket_widths: vec![BucketWidth::Hour, BucketWidth::Day],
            busy_timeout_ms: 5000,
            max_connections: 4,
            dispose_timeout_ms: 5000,
        }
    }
}

impl RollupConfig {
    /// Configured URL, else `<data dir>/stationlink/rollup.db`.
    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => {
                let path = dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(APP_DIR_NAME)
                    .join(DEFAULT_DATABASE_FILE);
                format!("sqlite://{}", path.display())
            }
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_timeout_ms)
    }
}
