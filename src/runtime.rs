//! Service runtime: builds and owns every component.
//!
//! Start order is bus, settings, listener, reading pipeline, rollup worker.
//! Shutdown runs in reverse under the listener's dispose timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{RelayBus, SubscriptionId};
use crate::config::{paths, AppConfig};
use crate::listener::{ListenerError, NetworkMonitor, PollingNetworkMonitor, UdpListener};
use crate::reading::{JsonReadingTransformer, ReadingPipeline, UnitPreferences};
#[cfg(feature = "sqlite")]
use crate::rollup::{RollupError, RollupWorker};
use crate::settings::{FileSettingsSource, SettingsError, SettingsRepository, SettingsSource};

/// Errors that can occur while starting the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[cfg(feature = "sqlite")]
    #[error("Rollup error: {0}")]
    Rollup(#[from] RollupError),
}

/// Running station core.
pub struct StationRuntime {
    config: AppConfig,
    cancel: CancellationToken,
    bus: Arc<RelayBus>,
    settings: Arc<SettingsRepository>,
    listener: Arc<UdpListener>,
    pipeline: Arc<ReadingPipeline>,
    network: Option<Arc<PollingNetworkMonitor>>,
    #[cfg(feature = "sqlite")]
    rollup: Option<Arc<RollupWorker>>,
    logging_subscription: SubscriptionId,
    tasks: Vec<JoinHandle<()>>,
}

impl StationRuntime {
    /// Start with the override file named by the configuration.
    pub async fn start(config: AppConfig) -> Result<Self, RuntimeError> {
        let source = Arc::new(FileSettingsSource::new(config.settings.override_path()));
        Self::start_with_source(config, source).await
    }

    pub async fn start_with_source(
        config: AppConfig,
        source: Arc<dyn SettingsSource>,
    ) -> Result<Self, RuntimeError> {
        let cancel = CancellationToken::new();
        let bus = RelayBus::shared(&config.bus);
        let settings = SettingsRepository::initialize(source, Arc::clone(&bus)).await?;

        let logging_subscription = settings.register_for_change_messages(paths::LOGGING, |value| {
            info!(
                path = %value.path,
                value = %value.value,
                "Logging setting changed; the active filter follows STATIONLINK_LOG"
            );
        });

        let units = UnitPreferences::from_lookup(|path| settings.get_value_or_default(path));
        let pipeline = ReadingPipeline::start(Arc::clone(&bus), Arc::new(JsonReadingTransformer), units);

        let network = network_monitor(&config, &cancel);
        let mut listener = UdpListener::new(config.listener.clone(), Arc::clone(&bus), &cancel);
        if let Some(monitor) = &network {
            listener = listener.with_network_monitor(Arc::clone(monitor) as Arc<dyn NetworkMonitor>);
        }
        let listener = Arc::new(listener);
        let preferred_port = preferred_port(&settings, config.listener.preferred_port);
        if let Err(e) = listener.initialize(preferred_port).await {
            pipeline.stop();
            cancel.cancel();
            return Err(e.into());
        }

        #[cfg(feature = "sqlite")]
        let rollup = match start_rollup(&config, &settings, &cancel).await {
            Ok(rollup) => rollup,
            Err(e) => {
                listener.dispose().await;
                pipeline.stop();
                cancel.cancel();
                return Err(e.into());
            }
        };

        let mut tasks = Vec::new();
        if let Some(task) = metrics_reporter(&config, &bus, &cancel) {
            tasks.push(task);
        }

        info!(
            bound_port = ?listener.bound_port(),
            metrics = bus.metrics_enabled(),
            "Station runtime started"
        );

        Ok(Self {
            config,
            cancel,
            bus,
            settings,
            listener,
            pipeline,
            network,
            #[cfg(feature = "sqlite")]
            rollup,
            logging_subscription,
            tasks,
        })
    }

    pub fn bus(&self) -> &Arc<RelayBus> {
        &self.bus
    }

    pub fn settings(&self) -> &Arc<SettingsRepository> {
        &self.settings
    }

    pub fn listener(&self) -> &Arc<UdpListener> {
        &self.listener
    }

    pub fn pipeline(&self) -> &Arc<ReadingPipeline> {
        &self.pipeline
    }

    #[cfg(feature = "sqlite")]
    pub fn rollup(&self) -> Option<&Arc<RollupWorker>> {
        self.rollup.as_ref()
    }

    /// Token cancelled on shutdown; callers may link their own work to it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Dispose every component in reverse start order.
    pub async fn shutdown(self) {
        info!("Station runtime shutting down");

        #[cfg(feature = "sqlite")]
        if let Some(rollup) = &self.rollup {
            rollup.dispose().await;
        }

        self.listener.dispose().await;
        self.pipeline.stop();
        if let Some(network) = &self.network {
            network.stop();
        }
        self.settings
            .unregister_change_messages(self.logging_subscription);

        self.cancel.cancel();
        let timeout = self.config.listener.dispose_timeout();
        if tokio::time::timeout(timeout, futures::future::join_all(self.tasks))
            .await
            .is_err()
        {
            warn!(?timeout, "Runtime tasks did not stop in time");
        }

        info!("Station runtime stopped");
    }
}

/// A local override of the setting wins; otherwise the configured port is used.
///
/// The packaged template value only documents the default and never shadows
/// `listener.preferred_port`.
fn preferred_port(settings: &SettingsRepository, fallback: u16) -> u16 {
    match settings.get_override(paths::UDP_LISTENER_PREFERRED_PORT) {
        Some(value) => match value.trim().parse() {
            Ok(port) => port,
            Err(e) => {
                warn!(value = %value, error = %e, fallback, "Invalid preferred port setting");
                fallback
            }
        },
        None => fallback,
    }
}

fn network_monitor(config: &AppConfig, cancel: &CancellationToken) -> Option<Arc<PollingNetworkMonitor>> {
    let interval = config.listener.network_probe_interval()?;
    match config.listener.network_probe_address.parse::<SocketAddr>() {
        Ok(address) => Some(PollingNetworkMonitor::start(address, interval, cancel.child_token())),
        Err(e) => {
            warn!(
                address = %config.listener.network_probe_address,
                error = %e,
                "Invalid network probe address, network monitoring disabled"
            );
            None
        }
    }
}

#[cfg(feature = "sqlite")]
async fn start_rollup(
    config: &AppConfig,
    settings: &SettingsRepository,
    cancel: &CancellationToken,
) -> Result<Option<Arc<RollupWorker>>, RollupError> {
    if !config.rollup.enabled {
        info!("Rollup worker disabled");
        return Ok(None);
    }

    let mut rollup_config = config.rollup.clone();
    if let Some(url) = settings
        .get_value_or_default(paths::DATABASE_ROLLUP_CONNECTION)
        .filter(|url| !url.trim().is_empty())
    {
        rollup_config.database_url = Some(url);
    }

    let worker = Arc::new(RollupWorker::new(rollup_config, cancel)?);
    worker.initialize().await?;
    Ok(Some(worker))
}

/// Periodically log and reset the relay bus metrics window.
fn metrics_reporter(config: &AppConfig, bus: &Arc<RelayBus>, cancel: &CancellationToken) -> Option<JoinHandle<()>> {
    if !bus.metrics_enabled() || config.bus.metrics_report_interval_secs == 0 {
        return None;
    }

    let bus = Arc::clone(bus);
    let cancel = cancel.clone();
    let top_n = config.bus.metrics_top_n;
    let period = Duration::from_secs(config.bus.metrics_report_interval_secs);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; skip the empty window.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(snapshot) = bus.take_metrics(top_n) else {
                break;
            };
            info!(
                window_secs = snapshot.window.as_secs(),
                distinct = snapshot.distinct,
                "Relay bus metrics"
            );
            for entry in &snapshot.entries {
                info!(
                    message = entry.message_kind,
                    subscriber = entry.subscriber_kind,
                    count = entry.count,
                    total_us = entry.total.as_micros() as u64,
                    max_us = entry.max.as_micros() as u64,
                    mean_us = entry.mean().as_micros() as u64,
                    "Relay bus delivery timing"
                );
            }
        }
    }))
}
