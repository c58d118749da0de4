//! stationlink: weather station telemetry core
//!
//! Listens for station broadcasts on UDP, classifies and republishes them on
//! the relay bus, keeps typed readings in the preferred units and rolls the
//! observation table up into hourly and daily buckets.
//!
//! ## Configuration
//! - `--config <path>` or STATIONLINK_CONFIG: YAML config file (default: stationlink.yaml)
//! - STATIONLINK__LISTENER__PREFERRED_PORT etc.: per-field overrides
//! - STATIONLINK_LOG: tracing filter (default: info)

use tracing::info;

use stationlink::config::AppConfig;
use stationlink::runtime::StationRuntime;
use stationlink::utils::bootstrap::{init_tracing, parse_config_path, wait_for_shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = AppConfig::load(config_path.as_deref())?;

    let runtime = StationRuntime::start(config).await?;
    info!(
        port = ?runtime.listener().bound_port(),
        "stationlink started"
    );

    wait_for_shutdown_signal().await;
    runtime.shutdown().await;

    Ok(())
}
