//! Persisted rollup progress.
//!
//! One row per (installation, source table, bucket width). The stored epoch
//! is the exclusive end of the aggregated range and never moves backward.

use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection};

use super::config::BucketWidth;
use super::schema::RollupWatermarks;

/// Identifies one watermark row.
#[derive(Debug, Clone, Copy)]
pub struct WatermarkKey<'a> {
    pub installation_id: &'a str,
    pub source_table: &'a str,
    pub width: BucketWidth,
}

pub async fn load(conn: &mut SqliteConnection, key: &WatermarkKey<'_>) -> Result<Option<i64>, sqlx::Error> {
    let query = Query::select()
        .column(RollupWatermarks::WatermarkEpoch)
        .from(RollupWatermarks::Table)
        .and_where(Expr::col(RollupWatermarks::InstallationId).eq(key.installation_id))
        .and_where(Expr::col(RollupWatermarks::SourceTable).eq(key.source_table))
        .and_where(Expr::col(RollupWatermarks::BucketWidth).eq(key.width.as_str()))
        .to_string(SqliteQueryBuilder);

    let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
    Ok(row.map(|row| row.get::<i64, _>("watermark_epoch")))
}

/// Upsert the watermark, keeping the larger of the stored and new epochs.
pub async fn store(conn: &mut SqliteConnection, key: &WatermarkKey<'_>, epoch: i64) -> Result<(), sqlx::Error> {
    let updated_at = chrono::Utc::now().to_rfc3339();

    let query = Query::insert()
        .into_table(RollupWatermarks::Table)
        .columns([
            RollupWatermarks::InstallationId,
            RollupWatermarks::SourceTable,
            RollupWatermarks::BucketWidth,
            RollupWatermarks::WatermarkEpoch,
            RollupWatermarks::UpdatedAt,
        ])
        .values_panic([
            key.installation_id.into(),
            key.source_table.into(),
            key.width.as_str().into(),
            epoch.into(),
            updated_at.into(),
        ])
        .on_conflict(
            OnConflict::columns([
                RollupWatermarks::InstallationId,
                RollupWatermarks::SourceTable,
                RollupWatermarks::BucketWidth,
            ])
            .value(
                RollupWatermarks::WatermarkEpoch,
                Expr::cust("MAX(watermark_epoch, excluded.watermark_epoch)"),
            )
            .update_column(RollupWatermarks::UpdatedAt)
            .to_owned(),
        )
        .to_string(SqliteQueryBuilder);

    sqlx::query(&query).execute(&mut *conn).await?;
    Ok(())
}
