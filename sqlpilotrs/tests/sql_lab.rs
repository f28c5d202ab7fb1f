//! Integration tests for the SQL Lab execution pipeline.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlpilot::authz::{DatabaseGrants, User};
use sqlpilot::cache::InMemoryResultsBackend;
use sqlpilot::config::SqlPilotConfig;
use sqlpilot::export::{export_cached_results, CsvOptions};
use sqlpilot::normalizer::CellValue;
use sqlpilot::sql_lab::{
    InMemoryQueryStore, QueryId, QueryPayload, QueryStatus, QueryStore, SqlLab, SqlLabRequest,
    TokioTaskScheduler, LOOKUP_FAILED_MESSAGE, STOPPED_MESSAGE,
};
use sqlpilot::SqlPilotError;

use common::{fast_config, manager, one_row, FakeConnection, RecordingStore, UnreachableScheduler};

fn user() -> User {
    User::new(7, "ana")
}

fn lab_with(conn: FakeConnection, config: SqlPilotConfig, store: Arc<dyn QueryStore>) -> SqlLab {
    let scheduler = Arc::new(TokioTaskScheduler::from_config(&config.defaults.sql_lab));
    SqlLab::new(Arc::new(manager(conn, config)), store, scheduler)
}

fn lab(conn: FakeConnection) -> SqlLab {
    lab_with(conn, fast_config(), Arc::new(InMemoryQueryStore::new()))
}

async fn wait_until(lab: &SqlLab, id: QueryId, done: impl Fn(&QueryPayload) -> bool) -> QueryPayload {
    for _ in 0..200 {
        let payload = lab.status(id).await.unwrap();
        if done(&payload) {
            return payload;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("query {id} never reached the expected state");
}

async fn wait_terminal(lab: &SqlLab, id: QueryId) -> QueryPayload {
    wait_until(lab, id, |p| p.status.is_terminal()).await
}

/// Results are stored after the row turns successful.
async fn wait_stored(lab: &SqlLab, id: QueryId) -> QueryPayload {
    wait_until(lab, id, |p| {
        p.query.as_ref().is_some_and(|q| q.results_key.is_some())
    })
    .await
}

fn config(toml: &str) -> SqlPilotConfig {
    let mut config = SqlPilotConfig::from_toml(toml).unwrap();
    config.defaults.sql_lab.lookup_retry_count = 3;
    config.defaults.sql_lab.lookup_backoff_ms = 5;
    config
}

// ============================================================================
// Synchronous runs
// ============================================================================

#[tokio::test]
async fn sync_select_returns_rows_under_row_ceiling() {
    let conn = FakeConnection::returning(one_row("x", CellValue::Int(1)));
    let lab = lab(conn.clone());

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT 1"), &user())
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::Success);
    assert_eq!(payload.data, vec![json!({"x": 1}).as_object().unwrap().clone()]);
    assert_eq!(conn.executed(), vec!["SELECT 1\nLIMIT 10000".to_string()]);

    let query = payload.query.unwrap();
    assert_eq!(query.rows, Some(1));
    assert_eq!(query.progress, 100);
    assert_eq!(query.limit, Some(10_000));
    assert_eq!(query.sql, "SELECT 1");
    assert!(query.end_time.is_some());
}

#[tokio::test]
async fn statements_run_in_order_on_one_session() {
    let conn = FakeConnection::returning(one_row("n", CellValue::Int(2)));
    let lab = lab(conn.clone());

    let payload = lab
        .submit(
            SqlLabRequest::new("main", "SET search_path = lab; SELECT 2 LIMIT 5;"),
            &user(),
        )
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::Success);
    assert_eq!(
        conn.executed(),
        vec!["SET search_path = lab".to_string(), "SELECT 2 LIMIT 5".to_string()]
    );
    assert_eq!(payload.query.unwrap().limit, Some(5));
}

#[tokio::test]
async fn row_ceiling_caps_the_final_statement() {
    let conn = FakeConnection::default();
    let lab = lab(conn.clone());

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT 1; SELECT * FROM big"), &user())
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::Success);
    assert_eq!(
        conn.executed(),
        vec!["SELECT 1".to_string(), "SELECT * FROM big\nLIMIT 10000".to_string()]
    );
    assert_eq!(payload.query.unwrap().limit, Some(10_000));
}

#[tokio::test]
async fn limit_in_a_comment_does_not_lift_the_ceiling() {
    let conn = FakeConnection::default();
    let lab = lab(conn.clone());

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT * FROM big -- limit 1"), &user())
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::Success);
    assert_eq!(
        conn.executed(),
        vec!["SELECT * FROM big\nLIMIT 10000".to_string()]
    );
    assert_eq!(payload.query.unwrap().limit, Some(10_000));
}

#[tokio::test]
async fn limit_with_offset_is_lowered_in_place() {
    let conn = FakeConnection::default();
    let lab = lab(conn.clone());

    let payload = lab
        .submit(
            SqlLabRequest::new("main", "SELECT * FROM big LIMIT 50000 OFFSET 10"),
            &user(),
        )
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::Success);
    assert_eq!(
        conn.executed(),
        vec!["SELECT * FROM big LIMIT 10000 OFFSET 10".to_string()]
    );
    assert_eq!(payload.query.unwrap().limit, Some(10_000));
}

#[tokio::test]
async fn execution_error_is_persisted_with_link() {
    let conn = FakeConnection::default().failing_on("missing_table");
    let config = config(
        r#"
[defaults.sql_lab]
troubleshooting_link = "https://wiki.example.com/sql-lab"
"#,
    );
    let store = Arc::new(InMemoryQueryStore::new());
    let lab = lab_with(conn, config, store.clone());

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT * FROM missing_table"), &user())
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::Failed);
    assert!(payload.error.as_deref().unwrap().contains("missing_table"));
    assert_eq!(payload.link.as_deref(), Some("https://wiki.example.com/sql-lab"));

    let row = store.get(payload.query_id).await.unwrap().unwrap();
    assert_eq!(row.status, QueryStatus::Failed);
    assert_eq!(row.error_message, payload.error);
}

#[tokio::test]
async fn dml_is_rejected_when_disallowed() {
    let conn = FakeConnection::default();
    let lab = lab_with(
        conn.clone(),
        config("[defaults.sql_lab]\nallow_dml = false\n"),
        Arc::new(InMemoryQueryStore::new()),
    );

    let payload = lab
        .submit(SqlLabRequest::new("main", "DELETE FROM orders"), &user())
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::Failed);
    assert_eq!(
        payload.error.as_deref(),
        Some("Only `SELECT` statements are allowed against this database")
    );
    assert!(conn.executed().is_empty());
}

#[tokio::test]
async fn create_table_as_select_records_select_sql() {
    let conn = FakeConnection::default();
    let lab = lab(conn.clone());
    let mut request = SqlLabRequest::new("main", "SELECT region FROM orders");
    request.select_as_cta = true;
    request.tmp_table_name = Some("scratch.tmp_regions".into());

    let payload = lab.submit(request, &user()).await.unwrap();

    assert_eq!(payload.status, QueryStatus::Success);
    assert_eq!(
        conn.executed(),
        vec!["CREATE TABLE scratch.tmp_regions AS \nSELECT region FROM orders".to_string()]
    );
    let query = payload.query.unwrap();
    assert!(query.select_as_cta_used);
    assert_eq!(
        query.select_sql.as_deref(),
        Some("SELECT * FROM \"scratch\".\"tmp_regions\"")
    );
}

#[tokio::test]
async fn create_table_as_requires_select() {
    let lab = lab(FakeConnection::default());
    let mut request = SqlLabRequest::new("main", "UPDATE orders SET status = 'x'");
    request.select_as_cta = true;

    let payload = lab.submit(request, &user()).await.unwrap();

    assert_eq!(payload.status, QueryStatus::Failed);
    assert_eq!(
        payload.error.as_deref(),
        Some("Only `SELECT` statements can be used with the CREATE TABLE feature.")
    );
    assert!(payload.query.unwrap().tmp_table_name.is_none());
}

#[tokio::test]
async fn soft_limit_ends_in_timed_out() {
    let conn = FakeConnection::default().with_delay(Duration::from_secs(5));
    let lab = lab_with(
        conn,
        config("[defaults.sql_lab]\nsoft_timeout_secs = 1\nsync_timeout_secs = 30\n"),
        Arc::new(InMemoryQueryStore::new()),
    );

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT pg_sleep(5)"), &user())
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::TimedOut);
    assert_eq!(
        payload.error.as_deref(),
        Some("SQL Lab timeout. This environment's policy is to kill queries after 1 seconds.")
    );
}

#[tokio::test]
async fn wall_clock_limit_ends_in_timed_out() {
    let conn = FakeConnection::default().with_delay(Duration::from_secs(5));
    let lab = lab_with(
        conn,
        config("[defaults.sql_lab]\nsoft_timeout_secs = 30\nsync_timeout_secs = 1\n"),
        Arc::new(InMemoryQueryStore::new()),
    );

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT pg_sleep(5)"), &user())
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::TimedOut);
    assert_eq!(
        payload.error.as_deref(),
        Some("Query exceeded the synchronous wall-clock limit of 1 seconds.")
    );
}

// ============================================================================
// Submission checks
// ============================================================================

#[tokio::test]
async fn template_params_are_expanded_before_execution() {
    let conn = FakeConnection::default();
    let lab = lab(conn.clone());
    let mut request = SqlLabRequest::new(
        "main",
        "SELECT * FROM orders WHERE region = '{{ region }}' AND owner = '{{ current_username() }}'",
    );
    request.template_params = Some(json!("{\"region\": \"EU\"}"));

    let payload = lab.submit(request, &user()).await.unwrap();

    assert_eq!(payload.status, QueryStatus::Success);
    assert!(conn.executed()[0].contains("region = 'EU' AND owner = 'ana'"));
    assert!(payload.query.unwrap().sql.contains("{{ region }}"));
}

#[tokio::test]
async fn template_errors_surface_before_a_row_is_written() {
    let store = Arc::new(InMemoryQueryStore::new());
    let lab = lab_with(FakeConnection::default(), fast_config(), store.clone());

    let err = lab
        .submit(SqlLabRequest::new("main", "SELECT {{ nope }}"), &user())
        .await
        .unwrap_err();

    assert!(matches!(err, SqlPilotError::Template(_)));
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn database_access_is_authorized() {
    let lab = lab(FakeConnection::default())
        .with_authorizer(Arc::new(DatabaseGrants::new().grant("bob", "main")));

    let err = lab
        .submit(SqlLabRequest::new("main", "SELECT 1"), &user())
        .await
        .unwrap_err();
    assert!(matches!(err, SqlPilotError::Permission(_)));
    assert_eq!(err.status_code(), 403);

    let err = lab
        .submit(SqlLabRequest::new("elsewhere", "SELECT 1"), &user())
        .await
        .unwrap_err();
    assert!(matches!(err, SqlPilotError::NotFound(_)));
}

#[tokio::test]
async fn lagging_store_is_retried() {
    let store = Arc::new(RecordingStore::lagging(2));
    let lab = lab_with(
        FakeConnection::returning(one_row("x", CellValue::Int(1))),
        fast_config(),
        store.clone(),
    );

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT 1"), &user())
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::Success);
}

#[tokio::test]
async fn lookup_gives_up_after_bounded_retries() {
    let store = Arc::new(RecordingStore::lagging(100));
    let lab = lab_with(FakeConnection::default(), fast_config(), store.clone());

    let err = lab
        .submit(SqlLabRequest::new("main", "SELECT 1"), &user())
        .await
        .unwrap_err();

    assert!(matches!(&err, SqlPilotError::SqlLab(msg) if msg == LOOKUP_FAILED_MESSAGE));
    assert_eq!(
        store.statuses_for(1).last().copied(),
        Some(QueryStatus::Failed)
    );
}

// ============================================================================
// Asynchronous runs
// ============================================================================

#[tokio::test]
async fn async_submit_returns_immediately() {
    let conn = FakeConnection::returning(one_row("x", CellValue::Int(1)))
        .with_delay(Duration::from_millis(200));
    let lab = lab(conn);

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT 1").run_async(true), &user())
        .await
        .unwrap();

    assert!(payload.query_id > 0);
    assert!(matches!(
        payload.status,
        QueryStatus::Pending | QueryStatus::Running
    ));
    assert!(payload.data.is_empty());

    let done = wait_terminal(&lab, payload.query_id).await;
    assert_eq!(done.status, QueryStatus::Success);
    assert!(done.data.is_empty(), "status never carries rows");
}

#[tokio::test]
async fn resubmitting_a_running_client_id_returns_the_same_query() {
    let conn = FakeConnection::returning(one_row("x", CellValue::Int(1)))
        .with_delay(Duration::from_millis(200));
    let lab = lab(conn.clone());
    let request = || {
        let mut request = SqlLabRequest::new("main", "SELECT 1").run_async(true);
        request.client_id = Some("tab-1".into());
        request
    };

    let first = lab.submit(request(), &user()).await.unwrap();
    let again = lab.submit(request(), &user()).await.unwrap();
    assert_eq!(first.query_id, again.query_id);

    wait_terminal(&lab, first.query_id).await;
    assert_eq!(conn.executed().len(), 1);
    let by_client = lab.status_by_client_id("tab-1").await.unwrap();
    assert_eq!(by_client.query_id, first.query_id);
    assert_eq!(by_client.status, QueryStatus::Success);

    let rerun = lab.submit(request(), &user()).await.unwrap();
    assert_ne!(rerun.query_id, first.query_id);
    assert!(matches!(
        lab.status_by_client_id("tab-9").await,
        Err(SqlPilotError::NotFound(_))
    ));
}

#[tokio::test]
async fn dispatch_failure_goes_straight_to_failed() {
    let store = Arc::new(RecordingStore::default());
    let config = fast_config();
    let connections = Arc::new(manager(FakeConnection::default(), config));
    let lab = SqlLab::new(connections, store.clone(), Arc::new(UnreachableScheduler));

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT 1").run_async(true), &user())
        .await
        .unwrap();

    assert_eq!(payload.status, QueryStatus::Failed);
    assert!(payload
        .error
        .as_deref()
        .unwrap()
        .starts_with("Failed to start remote query on a worker: connection refused."));
    assert_eq!(
        store.statuses_for(payload.query_id),
        vec![QueryStatus::Pending, QueryStatus::Failed]
    );
}

#[tokio::test]
async fn async_results_are_stored_and_exported() {
    let conn = FakeConnection::returning(one_row("region", CellValue::Text("EU".into())));
    let lab = lab(conn).with_results_backend(Arc::new(InMemoryResultsBackend::default()));

    let payload = lab
        .submit(
            SqlLabRequest::new("main", "SELECT region FROM orders").run_async(true),
            &user(),
        )
        .await
        .unwrap();
    let done = wait_stored(&lab, payload.query_id).await;
    assert_eq!(done.status, QueryStatus::Success);

    let key = done.query.unwrap().results_key.expect("results key");
    let stored = lab.fetch_results(&key).await.unwrap();
    assert_eq!(stored.status, QueryStatus::Success);
    assert_eq!(stored.data.len(), 1);
    assert_eq!(stored.columns[0].name, "region");

    let csv = export_cached_results(&lab, &key, CsvOptions::default())
        .await
        .unwrap();
    assert_eq!(String::from_utf8(csv).unwrap(), "region\nEU\n");
}

#[tokio::test]
async fn missing_results_are_expired() {
    let lab = lab(FakeConnection::default())
        .with_results_backend(Arc::new(InMemoryResultsBackend::default()));
    let err = lab.fetch_results("no-such-key").await.unwrap_err();
    assert!(matches!(err, SqlPilotError::ResultsExpired(_)));
    assert_eq!(err.status_code(), 410);
}

// ============================================================================
// Stop
// ============================================================================

#[tokio::test]
async fn stop_after_success_hides_rows() {
    let conn = FakeConnection::returning(one_row("x", CellValue::Int(1)));
    let lab = lab(conn).with_results_backend(Arc::new(InMemoryResultsBackend::default()));

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT 1").run_async(true), &user())
        .await
        .unwrap();
    let done = wait_stored(&lab, payload.query_id).await;
    assert_eq!(done.status, QueryStatus::Success);
    let key = done.query.unwrap().results_key.unwrap();

    lab.stop(payload.query_id).await.unwrap();

    let status = lab.status(payload.query_id).await.unwrap();
    assert_eq!(status.status, QueryStatus::Stopped);
    assert_eq!(status.error.as_deref(), Some(STOPPED_MESSAGE));
    assert!(status.data.is_empty());

    let replay = lab.fetch_results(&key).await.unwrap();
    assert_eq!(replay.status, QueryStatus::Stopped);
    assert!(replay.data.is_empty());
}

#[tokio::test]
async fn stop_while_running_discards_results() {
    let conn = FakeConnection::returning(one_row("x", CellValue::Int(1)))
        .with_delay(Duration::from_millis(300));
    let lab = lab(conn);

    let payload = lab
        .submit(SqlLabRequest::new("main", "SELECT 1").run_async(true), &user())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    lab.stop(payload.query_id).await.unwrap();

    // Let the worker finish its statement and observe the stop.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let done = lab.status(payload.query_id).await.unwrap();
    assert_eq!(done.status, QueryStatus::Stopped);
    assert_eq!(done.error.as_deref(), Some(STOPPED_MESSAGE));
    let query = done.query.unwrap();
    assert!(query.rows.is_none());
    assert!(query.results_key.is_none());
}

// ============================================================================
// Preview
// ============================================================================

#[tokio::test]
async fn preview_is_capped_by_row_ceiling() {
    let conn = FakeConnection::returning(one_row("id", CellValue::Int(3)));
    let lab = lab_with(
        conn.clone(),
        config("[defaults.sql_lab]\nmax_rows = 20\n"),
        Arc::new(InMemoryQueryStore::new()),
    );

    let rows = lab
        .preview("main", "orders", Some("public"), 100, &user())
        .await
        .unwrap();

    assert_eq!(rows.size, 1);
    assert_eq!(
        conn.executed(),
        vec!["SELECT * FROM \"public\".\"orders\"\nLIMIT 20".to_string()]
    );
}

#[tokio::test]
async fn preview_gives_up_at_the_wall_clock() {
    let conn = FakeConnection::default().with_delay(Duration::from_secs(3));
    let lab = lab_with(
        conn,
        config("[defaults.sql_lab]\nsync_timeout_secs = 1\n"),
        Arc::new(InMemoryQueryStore::new()),
    );

    let err = lab
        .preview("main", "orders", None, 10, &user())
        .await
        .unwrap_err();

    assert!(matches!(err, SqlPilotError::Timeout(_)));
    assert_eq!(err.status_code(), 408);
    assert_eq!(
        err.to_string(),
        "Query exceeded the synchronous wall-clock limit of 1 seconds."
    );
}
