use super::*;

fn config_in(dir: &tempfile::TempDir) -> RollupConfig {
    RollupConfig {
        database_url: Some(format!("sqlite://{}", dir.path().join("rollup.db").display())),
        reconnect_interval_secs: 3600,
        ..RollupConfig::default()
    }
}

async fn worker_in(dir: &tempfile::TempDir) -> RollupWorker {
    let worker = RollupWorker::new(config_in(dir), &CancellationToken::new()).unwrap();
    sqlx::raw_sql(CREATE_OBSERVATIONS_TABLE)
        .execute(worker.pool())
        .await
        .unwrap();
    worker
}

#[test]
fn test_identifier_validation() {
    assert!(validate_identifier("observations").is_ok());
    assert!(validate_identifier("_raw_2024").is_ok());
    assert!(validate_identifier("").is_err());
    assert!(validate_identifier("1table").is_err());
    assert!(validate_identifier("obs; DROP TABLE x").is_err());
    assert!(validate_identifier(&"a".repeat(65)).is_err());
}

#[tokio::test]
async fn test_bad_source_table_fails_fast() {
    let config = RollupConfig {
        source_table: "raw readings".to_string(),
        ..RollupConfig::default()
    };
    let pool = SqlitePoolOptions::new().connect_lazy_with(SqliteConnectOptions::new());
    assert!(matches!(
        RollupWorker::with_pool(config, pool, &CancellationToken::new()),
        Err(RollupError::InvalidIdentifier(_))
    ));
}

#[test]
fn test_connection_loss_classification() {
    assert!(is_connection_loss(&sqlx::Error::PoolTimedOut));
    assert!(is_connection_loss(&sqlx::Error::PoolClosed));
    assert!(is_connection_loss(&sqlx::Error::Io(std::io::Error::from(
        std::io::ErrorKind::BrokenPipe
    ))));
    assert!(!is_connection_loss(&sqlx::Error::RowNotFound));
    assert!(!is_connection_loss(&sqlx::Error::ColumnNotFound("x".into())));
}

#[tokio::test]
async fn test_tick_skips_while_previous_tick_runs() {
    let dir = tempfile::tempdir().unwrap();
    let worker = worker_in(&dir).await;

    let _held = worker.gate.lock().await;
    assert_eq!(worker.tick_once().await, TickOutcome::Busy);
}

#[tokio::test]
async fn test_empty_source_completes_without_work() {
    let dir = tempfile::tempdir().unwrap();
    let worker = worker_in(&dir).await;

    assert_eq!(worker.tick_once().await, TickOutcome::Completed(Vec::new()));
}

#[tokio::test]
async fn test_closed_pool_degrades_and_reconnect_is_throttled() {
    let dir = tempfile::tempdir().unwrap();
    let worker = worker_in(&dir).await;
    worker.pool().close().await;

    assert_eq!(worker.tick_once().await, TickOutcome::Degraded);
    assert!(!worker.is_available());
    assert_eq!(worker.tick_once().await, TickOutcome::Degraded);

    assert!(!worker.try_reconnect().await);
    // Second attempt inside the interval does not probe.
    let before = *worker.last_reconnect.lock().unwrap();
    assert!(!worker.try_reconnect().await);
    assert_eq!(*worker.last_reconnect.lock().unwrap(), before);
}

#[tokio::test]
async fn test_reconnect_restores_availability() {
    let dir = tempfile::tempdir().unwrap();
    let worker = worker_in(&dir).await;

    worker.mark_degraded(&sqlx::Error::PoolTimedOut);
    assert!(!worker.is_available());

    assert!(worker.try_reconnect().await);
    assert!(worker.is_available());
    assert_eq!(worker.tick_once().await, TickOutcome::Completed(Vec::new()));
}

#[tokio::test]
async fn test_initialize_and_dispose() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Arc::new(worker_in(&dir).await);

    worker.initialize().await.unwrap();
    assert!(worker.is_available());

    tokio::time::timeout(std::time::Duration::from_secs(2), worker.dispose())
        .await
        .unwrap();
    assert!(worker.pool().is_closed());
}

#[tokio::test]
async fn test_failed_span_rolls_back_and_frees_connection() {
    let dir = tempfile::tempdir().unwrap();
    let config = RollupConfig {
        bucket_widths: vec![BucketWidth::Hour],
        max_connections: 1,
        ..config_in(&dir)
    };
    let worker = RollupWorker::new(config, &CancellationToken::new()).unwrap();
    sqlx::raw_sql(CREATE_OBSERVATIONS_TABLE)
        .execute(worker.pool())
        .await
        .unwrap();
    // A bucket table with the wrong shape makes the upsert fail inside the transaction.
    sqlx::query("CREATE TABLE observation_rollup_hourly (installation_id TEXT)")
        .execute(worker.pool())
        .await
        .unwrap();
    for epoch in [0_i64, 1800, 7200] {
        sqlx::query("INSERT INTO observations (installation_id, device_received_epoch) VALUES ('st', ?)")
            .bind(epoch)
            .execute(worker.pool())
            .await
            .unwrap();
    }

    assert_eq!(worker.tick_once().await, TickOutcome::Completed(Vec::new()));
    assert!(worker.is_available());

    // The only pooled connection is not left inside a transaction.
    sqlx::query("BEGIN IMMEDIATE").execute(worker.pool()).await.unwrap();
    sqlx::query("ROLLBACK").execute(worker.pool()).await.unwrap();

    let watermarks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rollup_watermarks")
        .fetch_one(worker.pool())
        .await
        .unwrap();
    assert_eq!(watermarks, 0);
}
