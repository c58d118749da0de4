//! Incremental rollup of raw readings into hourly and daily buckets.
//!
//! Two timers drive the worker: a rollup tick and a reconnection tick that
//! only does work while the store is marked unavailable. Each processed
//! span is written together with its watermark in one `BEGIN IMMEDIATE`
//! transaction, so progress is all-or-nothing across crashes.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use sea_query::{Alias, Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod bucket;
mod config;
mod schema;
mod watermark;

pub use bucket::{align_down, plan_span, BucketSpan};
pub use config::{BucketWidth, RollupConfig, DEFAULT_SOURCE_TABLE};
pub use schema::{CREATE_OBSERVATIONS_TABLE, CREATE_WATERMARKS_TABLE};
pub use watermark::WatermarkKey;

use schema::Source;

/// Result type for rollup operations.
pub type Result<T> = std::result::Result<T, RollupError>;

/// Errors that can occur in the rollup worker.
#[derive(Debug, thiserror::Error)]
pub enum RollupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),
}

/// Whether an error means the store itself is unreachable.
///
/// Matches I/O and pool failures, and the SQLite busy, locked, I/O and
/// can't-open result codes.
pub fn is_connection_loss(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6 | 10 | 14)),
        _ => false,
    }
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = name.len() <= 64
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RollupError::InvalidIdentifier(name.to_string()))
    }
}

/// Progress made on one (installation, width) in a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidthProgress {
    pub installation_id: String,
    pub width: BucketWidth,
    pub span: BucketSpan,
    pub rows_written: u64,
}

/// Result of one rollup tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous tick still held the gate.
    Busy,
    /// The store is unavailable; waiting for reconnection.
    Degraded,
    /// Spans processed this tick. Empty when everything is caught up.
    Completed(Vec<WidthProgress>),
}

/// Watermark-driven rollup worker.
pub struct RollupWorker {
    config: RollupConfig,
    pool: SqlitePool,
    gate: tokio::sync::Mutex<()>,
    available: AtomicBool,
    schema_ready: AtomicBool,
    last_reconnect: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RollupWorker {
    /// Create a worker with a lazily connected pool for `config.database_url()`.
    ///
    /// Fails fast on an unusable URL or table name.
    pub fn new(config: RollupConfig, parent: &CancellationToken) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url())?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_lazy_with(options);
        Self::with_pool(config, pool, parent)
    }

    /// Create a worker over an existing pool.
    pub fn with_pool(config: RollupConfig, pool: SqlitePool, parent: &CancellationToken) -> Result<Self> {
        validate_identifier(&config.source_table)?;
        for id in &config.installation_ids {
            if id.is_empty() {
                return Err(RollupError::InvalidIdentifier(id.clone()));
            }
        }

        Ok(Self {
            config,
            pool,
            gate: tokio::sync::Mutex::new(()),
            available: AtomicBool::new(true),
            schema_ready: AtomicBool::new(false),
            last_reconnect: Mutex::new(None),
            cancel: parent.child_token(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Prepare the schema and start both timers.
    ///
    /// An unreachable store does not fail initialization; the worker starts
    /// degraded and the reconnection timer takes over.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.ensure_parent_dir().await;

        if let Err(e) = self.ensure_schema().await {
            match &e {
                RollupError::Database(db) if is_connection_loss(db) => {
                    self.mark_degraded(db);
                }
                _ => return Err(e),
            }
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(tick_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(reconnect_loop(Arc::clone(self))));
        drop(tasks);

        info!(
            source_table = %self.config.source_table,
            widths = ?self.config.bucket_widths,
            tick_secs = self.config.tick_interval_secs,
            available = self.is_available(),
            "Rollup worker started"
        );
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Create the bucket and watermark tables if absent.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(CREATE_WATERMARKS_TABLE).execute(&mut *conn).await?;
        for width in &self.config.bucket_widths {
            let sql = bucket::create_bucket_table_sql(width.table());
            sqlx::query(&sql).execute(&mut *conn).await?;
        }
        self.schema_ready.store(true, Ordering::SeqCst);
        debug!("Rollup schema ready");
        Ok(())
    }

    /// Run one rollup pass over every installation and width.
    ///
    /// Never queues: if another pass holds the gate this returns
    /// [`TickOutcome::Busy`] immediately.
    pub async fn tick_once(&self) -> TickOutcome {
        let Ok(_gate) = self.gate.try_lock() else {
            debug!("Rollup tick skipped, previous tick still running");
            return TickOutcome::Busy;
        };
        if !self.is_available() {
            return TickOutcome::Degraded;
        }

        if !self.schema_ready.load(Ordering::SeqCst) {
            if let Err(e) = self.ensure_schema().await {
                return self.fail_tick(e, "Failed to prepare rollup schema");
            }
        }

        let installations = match self.installations().await {
            Ok(ids) => ids,
            Err(e) => return self.fail_tick(e, "Failed to list installations"),
        };

        let mut progress = Vec::new();
        for installation in &installations {
            for &width in &self.config.bucket_widths {
                match self.roll_width(installation, width).await {
                    Ok(Some(done)) => progress.push(done),
                    Ok(None) => {}
                    Err(RollupError::Database(e)) if is_connection_loss(&e) => {
                        self.mark_degraded(&e);
                        return TickOutcome::Degraded;
                    }
                    Err(e) => {
                        error!(
                            installation_id = %installation,
                            width = %width,
                            error = %e,
                            "Rollup failed, continuing with next width"
                        );
                    }
                }
            }
        }

        if !progress.is_empty() {
            info!(spans = progress.len(), "Rollup tick complete");
        }
        TickOutcome::Completed(progress)
    }

    /// Probe the store and leave degraded mode on success.
    ///
    /// Attempts closer together than the reconnect interval are skipped.
    /// Returns whether the store is available afterwards.
    pub async fn try_reconnect(&self) -> bool {
        if self.is_available() {
            return true;
        }
        {
            let mut last = self
                .last_reconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = *last {
                if at.elapsed() < self.config.reconnect_interval() {
                    debug!("Reconnect attempt throttled");
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        match self.probe().await {
            Ok(()) => {
                self.available.store(true, Ordering::SeqCst);
                info!("Rollup store reachable again, resuming");
                true
            }
            Err(e) => {
                warn!(error = %e, "Rollup store still unavailable");
                false
            }
        }
    }

    /// Stop both timers and close the pool.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let timeout = self.config.dispose_timeout();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "Rollup timers did not stop in time");
        }
        self.pool.close().await;
        info!("Rollup worker disposed");
    }

    fn mark_degraded(&self, error: &sqlx::Error) {
        if self.available.swap(false, Ordering::SeqCst) {
            warn!(error = %error, "Rollup store unavailable, pausing rollups");
        }
    }

    fn fail_tick(&self, error: RollupError, message: &str) -> TickOutcome {
        match error {
            RollupError::Database(e) if is_connection_loss(&e) => {
                self.mark_degraded(&e);
                TickOutcome::Degraded
            }
            e => {
                error!(error = %e, "{}", message);
                TickOutcome::Completed(Vec::new())
            }
        }
    }

    /// Re-check the connection and re-apply connection tuning.
    async fn probe(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT 1").execute(&mut *conn).await?;
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
        let busy = format!("PRAGMA busy_timeout = {}", self.config.busy_timeout_ms);
        sqlx::query(&busy).execute(&mut *conn).await?;
        drop(conn);

        if !self.schema_ready.load(Ordering::SeqCst) {
            self.ensure_schema().await?;
        }
        Ok(())
    }

    async fn ensure_parent_dir(&self) {
        let options = match SqliteConnectOptions::from_str(&self.config.database_url()) {
            Ok(options) => options,
            Err(_) => return,
        };
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    warn!(path = %parent.display(), error = %e, "Failed to create database directory");
                }
            }
        }
    }

    async fn installations(&self) -> Result<Vec<String>> {
        if !self.config.installation_ids.is_empty() {
            return Ok(self.config.installation_ids.clone());
        }

        let query = Query::select()
            .distinct()
            .column(Source::InstallationId)
            .from(Alias::new(&self.config.source_table))
            .order_by(Source::InstallationId, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("installation_id"))
            .collect())
    }

    /// Earliest and latest device epochs for one installation.
    async fn source_bounds(
        conn: &mut SqliteConnection,
        source_table: &str,
        installation_id: &str,
    ) -> Result<Option<(i64, i64)>> {
        let query = Query::select()
            .expr_as(Expr::col(Source::DeviceReceivedEpoch).min(), Alias::new("earliest"))
            .expr_as(Expr::col(Source::DeviceReceivedEpoch).max(), Alias::new("latest"))
            .from(Alias::new(source_table))
            .and_where(Expr::col(Source::InstallationId).eq(installation_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&mut *conn).await?;
        let earliest: Option<i64> = row.try_get("earliest")?;
        let latest: Option<i64> = row.try_get("latest")?;
        Ok(earliest.zip(latest))
    }

    async fn roll_width(&self, installation_id: &str, width: BucketWidth) -> Result<Option<WidthProgress>> {
        let key = WatermarkKey {
            installation_id,
            source_table: &self.config.source_table,
            width,
        };

        let mut conn = self.pool.acquire().await?;
        let current = watermark::load(&mut conn, &key).await?;
        let Some((earliest, latest)) =
            Self::source_bounds(&mut conn, &self.config.source_table, installation_id).await?
        else {
            return Ok(None);
        };

        let Some(span) = plan_span(
            current,
            earliest,
            latest,
            width.seconds(),
            self.config.max_buckets_per_tick,
        ) else {
            debug!(installation_id, width = %width, watermark = ?current, "No complete buckets");
            return Ok(None);
        };

        if current.is_none() {
            info!(installation_id, width = %width, seed = span.start, "Seeding rollup watermark");
        }

        // BEGIN IMMEDIATE takes the write lock upfront so the bucket rows and
        // the watermark land together or not at all.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = match self.apply_span(&mut conn, &key, span).await {
            Ok(rows) => sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map(|_| rows)
                .map_err(RollupError::from),
            Err(e) => Err(e),
        };

        let rows_written = match result {
            Ok(rows) => rows,
            Err(e) => {
                // A connection with an open transaction must not return to the pool.
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!(error = %rollback, "Rollback failed, discarding connection");
                    conn.close_on_drop();
                }
                return Err(e);
            }
        };

        debug!(
            installation_id,
            width = %width,
            start = span.start,
            end = span.end,
            rows_written,
            "Rolled up span"
        );

        Ok(Some(WidthProgress {
            installation_id: installation_id.to_string(),
            width,
            span,
            rows_written,
        }))
    }

    async fn apply_span(&self, conn: &mut SqliteConnection, key: &WatermarkKey<'_>, span: BucketSpan) -> Result<u64> {
        let sql = bucket::upsert_sql(key.source_table, key.width.table(), key.width.seconds());
        let updated_at = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(&sql)
            .bind(key.installation_id)
            .bind(span.start)
            .bind(span.end)
            .bind(updated_at)
            .execute(&mut *conn)
            .await?;

        watermark::store(conn, key, span.end).await?;
        Ok(result.rows_affected())
    }
}

impl Drop for RollupWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn tick_loop(worker: Arc<RollupWorker>) {
    let mut ticker = tokio::time::interval(worker.config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = worker.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !worker.is_available() {
            continue;
        }
        // Not raced against cancellation: a dropped tick could leave its
        // transaction open on a pooled connection.
        let outcome = worker.tick_once().await;
        debug!(?outcome, "Rollup tick finished");
    }
    debug!("Rollup tick loop stopped");
}

async fn reconnect_loop(worker: Arc<RollupWorker>) {
    let mut ticker = tokio::time::interval(worker.config.reconnect_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = worker.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if worker.is_available() {
            continue;
        }
        tokio::select! {
            _ = worker.cancel.cancelled() => break,
            _ = worker.try_reconnect() => {}
        }
    }
    debug!("Rollup reconnect loop stopped");
}

#[cfg(test)]
mod tests;
