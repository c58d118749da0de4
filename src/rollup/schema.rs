//! Rollup schema definitions using sea-query.

use sea_query::Iden;

/// Watermark table schema.
#[derive(Iden)]
pub enum RollupWatermarks {
    Table,
    #[iden = "installation_id"]
    InstallationId,
    #[iden = "source_table"]
    SourceTable,
    #[iden = "bucket_width"]
    BucketWidth,
    #[iden = "watermark_epoch"]
    WatermarkEpoch,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Columns the worker reads from the raw-reading table.
#[derive(Iden)]
pub enum Source {
    #[iden = "installation_id"]
    InstallationId,
    #[iden = "device_received_epoch"]
    DeviceReceivedEpoch,
}

/// SQL for creating the watermark table.
pub const CREATE_WATERMARKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rollup_watermarks (
    installation_id TEXT NOT NULL,
    source_table TEXT NOT NULL,
    bucket_width TEXT NOT NULL,
    watermark_epoch INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (installation_id, source_table, bucket_width)
);
"#;

/// Raw-reading table layout the worker expects. The table itself is owned
/// by the raw store; this is used to provision test and development databases.
pub const CREATE_OBSERVATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS observations (
    installation_id TEXT NOT NULL,
    device_received_epoch INTEGER NOT NULL,
    air_temperature REAL,
    relative_humidity REAL,
    station_pressure REAL,
    wind_avg REAL,
    wind_gust REAL,
    wind_lull REAL,
    uv REAL,
    solar_radiation REAL,
    illuminance REAL,
    rain_accumulation REAL,
    lightning_strike_count INTEGER,
    precipitation_type INTEGER
);

CREATE INDEX IF NOT EXISTS idx_observations_installation_epoch
    ON observations(installation_id, device_received_epoch);
"#;
