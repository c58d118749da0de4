//! In-process relay bus.
//!
//! Two independent channels share one component:
//! - a typed broadcast (`send` / `register` / `unregister`) keyed by message
//!   type, holding subscribers weakly
//! - a path-keyed broadcast (`send_setting` / `register_path`) used for
//!   configuration-change propagation with prefix matching
//!
//! Delivery is synchronous on the publisher's thread. Each subscriber sees a
//! publisher's messages in publish order; there is no ordering across
//! subscribers.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

mod metrics;
mod path;
mod typed;

pub use metrics::{MetricEntry, MetricsSnapshot, RelayMetrics};

use crate::settings::SettingValue;
use path::PathChannel;
use typed::TypedChannel;

/// Default number of entries returned by a metrics snapshot.
pub const DEFAULT_METRICS_TOP_N: usize = 10;

/// Handle for a single registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Relay bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Record per (message, subscriber) delivery timing.
    pub metrics_enabled: bool,
    /// Entries returned by the periodic metrics report.
    pub metrics_top_n: usize,
    /// Seconds between metrics reports (0 disables the report).
    pub metrics_report_interval_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_top_n: DEFAULT_METRICS_TOP_N,
            metrics_report_interval_secs: 300,
        }
    }
}

/// In-process pub/sub with typed and path-keyed channels.
pub struct RelayBus {
    typed: TypedChannel,
    paths: PathChannel,
    metrics: Option<RelayMetrics>,
}

impl Default for RelayBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

impl RelayBus {
    /// Create a bus. Metrics are allocated only when enabled.
    pub fn new(config: &BusConfig) -> Self {
        info!(metrics_enabled = config.metrics_enabled, "Relay bus initialized");

        Self {
            typed: TypedChannel::default(),
            paths: PathChannel::default(),
            metrics: config.metrics_enabled.then(RelayMetrics::new),
        }
    }

    /// Create a shared bus.
    pub fn shared(config: &BusConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    // ------------------------------------------------------------------
    // Typed channel
    // ------------------------------------------------------------------

    /// Register `handler` for messages of type `M` on behalf of `subscriber`.
    ///
    /// Only a weak reference to `subscriber` is kept. Once the last strong
    /// reference is dropped, deliveries stop and the registration is pruned.
    pub fn register<S, M, F>(&self, subscriber: &Arc<S>, handler: F) -> SubscriptionId
    where
        S: Send + Sync + 'static,
        M: Send + Sync + 'static,
        F: Fn(&S, &M) + Send + Sync + 'static,
    {
        self.typed.register(subscriber, handler)
    }

    /// Remove all typed registrations for `subscriber`. Returns how many were removed.
    pub fn unregister<S>(&self, subscriber: &Arc<S>) -> usize {
        self.typed.unregister(subscriber)
    }

    /// Remove a single typed registration.
    pub fn unregister_id(&self, id: SubscriptionId) -> bool {
        self.typed.unregister_id(id)
    }

    /// Deliver `message` to every live subscriber of `M`.
    ///
    /// Returns the number of subscribers that received it.
    pub fn send<M>(&self, message: &M) -> usize
    where
        M: Send + Sync + 'static,
    {
        self.typed.send(message, self.metrics.as_ref())
    }

    /// Number of registrations currently held for `M` (live or not yet pruned).
    pub fn subscriber_count<M: 'static>(&self) -> usize {
        self.typed.subscriber_count::<M>()
    }

    // ------------------------------------------------------------------
    // Path channel
    // ------------------------------------------------------------------

    /// Register `handler` for every setting whose path starts with `prefix`.
    pub fn register_path<F>(&self, prefix: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&SettingValue) + Send + Sync + 'static,
    {
        self.paths.register(prefix.into(), handler)
    }

    /// Remove a path registration.
    pub fn unregister_path(&self, id: SubscriptionId) -> bool {
        self.paths.unregister(id)
    }

    /// Deliver a setting change to every matching path handler.
    ///
    /// Returns the number of handlers invoked.
    pub fn send_setting(&self, value: &SettingValue) -> usize {
        self.paths.send(value)
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    /// Whether delivery metrics are being recorded.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }

    /// Take the current metrics window and start a new one.
    ///
    /// Returns `None` when metrics are disabled.
    pub fn take_metrics(&self, top_n: usize) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(|m| m.snapshot_and_reset(top_n))
    }
}

#[cfg(test)]
mod tests;
