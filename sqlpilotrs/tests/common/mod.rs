//! Fakes shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlpilot::backends::{BackendConnection, BackendSession, ConnectionManager};
use sqlpilot::cache::{ColumnSchema, TableSchema};
use sqlpilot::config::SqlPilotConfig;
use sqlpilot::error::{Result, SqlPilotError};
use sqlpilot::models::Dataset;
use sqlpilot::normalizer::{CellValue, RawColumn, RawResult};
use sqlpilot::sql_lab::{
    InMemoryQueryStore, Query, QueryId, QueryMutation, QueryStatus, QueryStore, SqlTask,
    TaskHandle, TaskJob, TaskScheduler,
};

/// Backend that answers every statement with a canned result.
#[derive(Clone, Default)]
pub struct FakeConnection {
    pub executed: Arc<Mutex<Vec<String>>>,
    pub result: RawResult,
    /// Statements containing this text fail with a driver error.
    pub fail_on: Option<String>,
    pub delay: Option<Duration>,
    pub columns: Vec<&'static str>,
}

impl FakeConnection {
    pub fn returning(result: RawResult) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on = Some(text.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_columns(mut self, columns: &[&'static str]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    async fn answer(&self, sql: &str) -> Result<RawResult> {
        self.executed.lock().unwrap().push(sql.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(text) = &self.fail_on {
            if sql.contains(text.as_str()) {
                return Err(SqlPilotError::Execution(format!("relation {text} does not exist")));
            }
        }
        Ok(self.result.clone())
    }
}

#[async_trait]
impl BackendConnection for FakeConnection {
    fn engine(&self) -> &str {
        "postgresql"
    }

    async fn fetch_schema(&self, _table: &str, _schema: Option<&str>) -> Result<TableSchema> {
        Ok(TableSchema {
            columns: self
                .columns
                .iter()
                .map(|name| ColumnSchema {
                    name: name.to_string(),
                    data_type: "VARCHAR".to_string(),
                    nullable: true,
                })
                .collect(),
        })
    }

    async fn execute_sql(&self, sql: &str) -> Result<RawResult> {
        self.answer(sql).await
    }

    async fn open_session(&self, _schema: Option<&str>) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(FakeSession {
            conn: self.clone(),
        }))
    }
}

pub struct FakeSession {
    conn: FakeConnection,
}

#[async_trait]
impl BackendSession for FakeSession {
    async fn execute(&mut self, sql: &str) -> Result<RawResult> {
        self.conn.answer(sql).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Scheduler whose queue is never reachable.
pub struct UnreachableScheduler;

impl TaskScheduler for UnreachableScheduler {
    fn submit(&self, _task: &SqlTask, _job: TaskJob) -> Result<TaskHandle> {
        Err(SqlPilotError::Dispatch("connection refused".to_string()))
    }
}

/// Store that records every status a row is written with, and can hide
/// freshly inserted rows for a number of reads.
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryQueryStore,
    pub statuses: Mutex<Vec<(QueryId, QueryStatus)>>,
    hidden_reads: AtomicUsize,
}

impl RecordingStore {
    pub fn lagging(hidden_reads: usize) -> Self {
        Self {
            hidden_reads: AtomicUsize::new(hidden_reads),
            ..Self::default()
        }
    }

    pub fn statuses_for(&self, id: QueryId) -> Vec<QueryStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| *q == id)
            .map(|(_, s)| *s)
            .collect()
    }

    fn record(&self, query: &Query) {
        self.statuses.lock().unwrap().push((query.id, query.status));
    }
}

#[async_trait]
impl QueryStore for RecordingStore {
    async fn insert(&self, query: Query) -> Result<Query> {
        let query = self.inner.insert(query).await?;
        self.record(&query);
        Ok(query)
    }

    async fn get(&self, id: QueryId) -> Result<Option<Query>> {
        let hide = self
            .hidden_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hide {
            return Ok(None);
        }
        self.inner.get(id).await
    }

    async fn modify(&self, id: QueryId, mutation: QueryMutation) -> Result<Query> {
        let query = self.inner.modify(id, mutation).await?;
        self.record(&query);
        Ok(query)
    }

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Query>> {
        self.inner.find_by_client_id(client_id).await
    }
}

pub fn one_row(name: &str, value: CellValue) -> RawResult {
    RawResult {
        columns: vec![RawColumn::new(name)],
        rows: vec![vec![value]],
    }
}

/// Manager with a single `main` database backed by `conn`.
pub fn manager(conn: FakeConnection, config: SqlPilotConfig) -> ConnectionManager {
    let mut connections = ConnectionManager::with_config(config);
    connections.insert("main", Arc::new(conn));
    connections
}

/// Defaults tuned for fast tests: quick lookups, short soft limits.
pub fn fast_config() -> SqlPilotConfig {
    SqlPilotConfig::from_toml(
        r#"
[defaults.sql_lab]
lookup_retry_count = 3
lookup_backoff_ms = 5
"#,
    )
    .unwrap()
}

pub fn orders_dataset() -> Dataset {
    serde_yaml::from_str(
        r#"
name: orders
database: main
table: orders
main_dttm_col: created_at
columns:
  - column_name: created_at
    type: TIMESTAMP
    is_dttm: true
  - column_name: region
    type: VARCHAR
  - column_name: status
    type: VARCHAR
  - column_name: amount
    type: DOUBLE
    sum: true
metrics:
  - metric_name: revenue
    expression: SUM(amount)
"#,
    )
    .unwrap()
}
