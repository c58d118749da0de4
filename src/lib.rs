//! Stationlink - weather station telemetry core
//!
//! UDP ingestion of station broadcasts, an in-process relay bus, a live
//! settings repository and an incremental SQLite rollup worker.

pub mod bus;
pub mod config;
pub mod listener;
pub mod packet;
pub mod reading;
#[cfg(feature = "sqlite")]
pub mod rollup;
pub mod runtime;
pub mod settings;
pub mod utils;
