//! Bucket arithmetic and the aggregate upsert.
//!
//! A span is a half-open range `[start, end)` of aligned bucket starts. The
//! upper bound of every span is the start of the bucket holding the latest
//! source row, so the bucket still receiving readings is never closed.

/// Largest multiple of `width` not greater than `epoch`.
pub fn align_down(epoch: i64, width: i64) -> i64 {
    epoch.div_euclid(width) * width
}

/// Range of source epochs to aggregate in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpan {
    pub start: i64,
    pub end: i64,
}

impl BucketSpan {
    pub fn buckets(&self, width: i64) -> i64 {
        (self.end - self.start) / width
    }
}

/// Work for one tick, or `None` when nothing is complete yet.
///
/// `watermark` is the exclusive end of everything already aggregated. With
/// no watermark the span starts at the bucket holding the earliest row.
pub fn plan_span(
    watermark: Option<i64>,
    earliest: i64,
    latest: i64,
    width: i64,
    max_buckets: u32,
) -> Option<BucketSpan> {
    let start = watermark.unwrap_or_else(|| align_down(earliest, width));
    let upper = align_down(latest, width);
    if start >= upper {
        return None;
    }
    let capped = start.saturating_add(i64::from(max_buckets.max(1)).saturating_mul(width));
    Some(BucketSpan {
        start,
        end: upper.min(capped),
    })
}

/// Output column, its SQL type and the aggregate over the bucketed rows.
const AGGREGATES: &[(&str, &str, &str)] = &[
    ("sample_count", "INTEGER NOT NULL", "COUNT(*)"),
    ("air_temperature_avg", "REAL", "AVG(air_temperature)"),
    ("air_temperature_min", "REAL", "MIN(air_temperature)"),
    ("air_temperature_max", "REAL", "MAX(air_temperature)"),
    ("relative_humidity_avg", "REAL", "AVG(relative_humidity)"),
    ("relative_humidity_min", "REAL", "MIN(relative_humidity)"),
    ("relative_humidity_max", "REAL", "MAX(relative_humidity)"),
    ("station_pressure_avg", "REAL", "AVG(station_pressure)"),
    ("station_pressure_min", "REAL", "MIN(station_pressure)"),
    ("station_pressure_max", "REAL", "MAX(station_pressure)"),
    ("wind_avg", "REAL", "AVG(wind_avg)"),
    ("wind_lull_min", "REAL", "MIN(wind_lull)"),
    ("wind_gust_max", "REAL", "MAX(wind_gust)"),
    ("uv_avg", "REAL", "AVG(uv)"),
    ("uv_max", "REAL", "MAX(uv)"),
    ("solar_radiation_avg", "REAL", "AVG(solar_radiation)"),
    ("solar_radiation_max", "REAL", "MAX(solar_radiation)"),
    ("illuminance_avg", "REAL", "AVG(illuminance)"),
    ("illuminance_max", "REAL", "MAX(illuminance)"),
    ("rain_accumulation_sum", "REAL", "SUM(rain_accumulation)"),
    ("lightning_strike_count_sum", "INTEGER", "SUM(lightning_strike_count)"),
];

/// Categorical column reduced to its most frequent value (lowest on ties).
const MODE_COLUMN: &str = "precipitation_type_mode";

/// SQL creating the output table for one bucket width.
///
/// `table` must already be a validated identifier.
pub fn create_bucket_table_sql(table: &str) -> String {
    let columns: Vec<String> = AGGREGATES
        .iter()
        .map(|(name, ty, _)| format!("    {} {},", name, ty))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    installation_id TEXT NOT NULL,\n    bucket_start INTEGER NOT NULL,\n    bucket_width INTEGER NOT NULL,\n{columns}\n    {mode} INTEGER,\n    updated_at TEXT NOT NULL,\n    PRIMARY KEY (installation_id, bucket_start)\n);",
        table = table,
        columns = columns.join("\n"),
        mode = MODE_COLUMN,
    )
}

/// Aggregate `[start, end)` of one installation into `target`, replacing
/// any existing bucket rows.
///
/// Bind order: installation id, start, end, updated_at. `source` and
/// `target` must already be validated identifiers.
pub fn upsert_sql(source: &str, target: &str, width: i64) -> String {
    let names: Vec<&str> = AGGREGATES.iter().map(|(name, _, _)| *name).collect();
    let exprs: Vec<&str> = AGGREGATES.iter().map(|(_, _, expr)| *expr).collect();
    let updates: Vec<String> = names
        .iter()
        .chain(std::iter::once(&MODE_COLUMN))
        .chain(std::iter::once(&"updated_at"))
        .map(|name| format!("{name} = excluded.{name}"))
        .collect();

    // bucket_start floors like align_down; SQLite `/` truncates toward zero.
    // WHERE true keeps SQLite from reading ON CONFLICT as a join constraint.
    format!(
        r#"WITH bucketed AS (
    SELECT *, device_received_epoch - (((device_received_epoch % {width}) + {width}) % {width}) AS bucket_start
    FROM {source}
    WHERE installation_id = ? AND device_received_epoch >= ? AND device_received_epoch < ?
),
modes AS (
    SELECT bucket_start, precipitation_type AS mode_value
    FROM (
        SELECT bucket_start, precipitation_type,
               ROW_NUMBER() OVER (
                   PARTITION BY bucket_start
                   ORDER BY COUNT(*) DESC, precipitation_type ASC
               ) AS mode_rank
        FROM bucketed
        WHERE precipitation_type IS NOT NULL
        GROUP BY bucket_start, precipitation_type
    )
    WHERE mode_rank = 1
)
INSERT INTO {target} (installation_id, bucket_start, bucket_width, {names}, {mode}, updated_at)
SELECT b.installation_id, b.bucket_start, {width}, {exprs}, MAX(m.mode_value), ?
FROM bucketed b LEFT JOIN modes m ON m.bucket_start = b.bucket_start
WHERE true
GROUP BY b.installation_id, b.bucket_start
ON CONFLICT (installation_id, bucket_start) DO UPDATE SET
    {updates}"#,
        width = width,
        source = source,
        target = target,
        names = names.join(", "),
        mode = MODE_COLUMN,
        exprs = exprs
            .iter()
            .map(|e| qualify(e))
            .collect::<Vec<_>>()
            .join(", "),
        updates = updates.join(",\n    "),
    )
}

/// Prefix the column inside `AGG(column)` with the `b.` alias.
fn qualify(expr: &str) -> String {
    match expr.split_once('(') {
        Some((func, rest)) if rest != "*)" => format!("{}(b.{}", func, rest),
        _ => expr.to_string(),
    }
}
