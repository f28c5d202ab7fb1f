//! DuckDB backend implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime};
use duckdb::types::{TimeUnit, Value as DuckValue};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::cache::{ColumnSchema, TableSchema};
use crate::error::{Result, SqlPilotError};
use crate::normalizer::{CellValue, RawColumn, RawResult};

use super::{BackendConnection, BackendSession};

/// DuckDB connection implementing the unified backend trait.
///
/// Every pooled connection and session is cloned from one root connection,
/// so they all share a single database instance.
#[derive(Clone)]
pub struct DuckDbConnection {
    database_path: PathBuf,
    limiter: Arc<Semaphore>,
    root: Arc<std::sync::Mutex<Option<duckdb::Connection>>>,
    pool: Arc<Mutex<Vec<duckdb::Connection>>>,
}

impl DuckDbConnection {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        tracing::info!(path = %path.display(), max_concurrency = 16, "creating DuckDB connection");
        Self {
            database_path: path,
            limiter: Arc::new(Semaphore::new(16)),
            root: Arc::new(std::sync::Mutex::new(None)),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configure maximum concurrent pooled executions.
    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        tracing::debug!(max_concurrency = max_in_flight, "configuring DuckDB concurrency");
        self.limiter = Arc::new(Semaphore::new(max_in_flight));
        self
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        let available = self.limiter.available_permits();
        if available == 0 {
            tracing::debug!("all DuckDB slots in use, waiting for permit");
        }
        self.limiter
            .acquire()
            .await
            .map_err(|e| SqlPilotError::Execution(format!("limiter closed: {e}")))
    }

    fn open(&self) -> Result<duckdb::Connection> {
        let mut root = self
            .root
            .lock()
            .map_err(|_| SqlPilotError::Execution("duckdb root connection poisoned".to_string()))?;
        if root.is_none() {
            tracing::debug!(path = %self.database_path.display(), "opening DuckDB database");
            let conn = duckdb::Connection::open(self.database_path.clone())
                .map_err(|e| SqlPilotError::Execution(format!("open duckdb: {e}")))?;
            *root = Some(conn);
        }
        let conn = root
            .as_ref()
            .ok_or_else(|| SqlPilotError::Execution("duckdb database unavailable".to_string()))?;
        Ok(conn.try_clone()?)
    }

    async fn checkout_connection(&self) -> Result<duckdb::Connection> {
        let mut guard = self.pool.lock().await;
        if let Some(conn) = guard.pop() {
            let pool_size = guard.len();
            drop(guard);
            tracing::trace!(pool_remaining = pool_size, "reusing pooled DuckDB connection");
            return Ok(conn);
        }
        drop(guard);
        self.open()
    }

    async fn checkin(&self, conn: duckdb::Connection) {
        self.pool.lock().await.push(conn);
    }
}

#[async_trait]
impl BackendConnection for DuckDbConnection {
    fn engine(&self) -> &str {
        "duckdb"
    }

    async fn fetch_schema(&self, table: &str, schema: Option<&str>) -> Result<TableSchema> {
        let qualified = match schema {
            Some(schema) => format!("{schema}.{table}"),
            None => table.to_string(),
        };
        let conn = self.checkout_connection().await?;
        let result =
            tokio::task::spawn_blocking(move || -> Result<(TableSchema, duckdb::Connection)> {
                let start = Instant::now();
                let conn = conn;

                let pragma_sql = format!("PRAGMA table_info('{}')", qualified.replace('\'', "''"));
                let mut columns = Vec::new();
                {
                    let mut stmt = conn.prepare(&pragma_sql)?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        let name: String = row.get("name")?;
                        let data_type: String = row.get("type")?;
                        let not_null: bool = row.get("notnull")?;
                        columns.push(ColumnSchema {
                            name,
                            data_type,
                            nullable: !not_null,
                        });
                    }
                }

                let elapsed = start.elapsed();
                tracing::debug!(
                    table = qualified.as_str(),
                    ms = elapsed.as_millis(),
                    "duckdb fetch_schema"
                );
                Ok((TableSchema { columns }, conn))
            })
            .await
            .map_err(|e| SqlPilotError::Execution(format!("task join error: {e}")))?;

        let (schema, conn) = result?;
        self.checkin(conn).await;
        Ok(schema)
    }

    async fn execute_sql(&self, sql: &str) -> Result<RawResult> {
        let sql = sql.to_string();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;
        let (result, conn) = run_blocking(conn, sql).await?;
        self.checkin(conn).await;
        result
    }

    async fn open_session(&self, schema: Option<&str>) -> Result<Box<dyn BackendSession>> {
        let conn = self.open()?;
        let mut session = DuckDbSession { conn: Some(conn) };
        if let Some(schema) = schema {
            session
                .execute(&format!("SET schema = '{}'", schema.replace('\'', "''")))
                .await?;
        }
        Ok(Box::new(session))
    }
}

/// Fresh connection dedicated to one SQL Lab query.
struct DuckDbSession {
    conn: Option<duckdb::Connection>,
}

#[async_trait]
impl BackendSession for DuckDbSession {
    async fn execute(&mut self, sql: &str) -> Result<RawResult> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| SqlPilotError::Execution("duckdb session is closed".to_string()))?;
        let (result, conn) = run_blocking(conn, sql.to_string()).await?;
        self.conn = Some(conn);
        result
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if let Some(conn) = self.conn {
            conn.close().map_err(|(_, e)| SqlPilotError::DuckDb(e))?;
        }
        Ok(())
    }
}

/// Run `sql` off the async runtime; the connection is handed back even when
/// the statement fails.
async fn run_blocking(
    conn: duckdb::Connection,
    sql: String,
) -> Result<(Result<RawResult>, duckdb::Connection)> {
    tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        let result = query_raw(&conn, &sql);
        if let Ok(raw) = &result {
            tracing::debug!(
                rows = raw.rows.len(),
                columns = raw.columns.len(),
                ms = start.elapsed().as_millis(),
                "duckdb execute_sql"
            );
        }
        (result, conn)
    })
    .await
    .map_err(|e| SqlPilotError::Execution(format!("task join error: {e}")))
}

fn query_raw(conn: &duckdb::Connection, sql: &str) -> Result<RawResult> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows_iter = stmt.query([])?;
    let stmt_ref = rows_iter
        .as_ref()
        .ok_or_else(|| SqlPilotError::Execution("statement missing".to_string()))?;
    let mut columns = Vec::new();
    for idx in 0..stmt_ref.column_count() {
        let name = stmt_ref
            .column_name(idx)
            .map_err(|e| SqlPilotError::Execution(e.to_string()))?;
        let type_hint = stmt_ref.column_type(idx).to_string();
        columns.push(RawColumn::typed(name.to_string(), type_hint));
    }
    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut cells = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            cells.push(duck_value_to_cell(row.get_ref(idx)?.to_owned()));
        }
        rows.push(cells);
    }
    Ok(RawResult { columns, rows })
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

pub(crate) fn duck_value_to_cell(value: DuckValue) -> CellValue {
    match value {
        DuckValue::Null => CellValue::Null,
        DuckValue::Boolean(b) => CellValue::Bool(b),
        DuckValue::TinyInt(i) => CellValue::Int(i.into()),
        DuckValue::SmallInt(i) => CellValue::Int(i.into()),
        DuckValue::Int(i) => CellValue::Int(i.into()),
        DuckValue::BigInt(i) => CellValue::Int(i),
        DuckValue::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => CellValue::Int(small),
            Err(_) => CellValue::Decimal(i.to_string()),
        },
        DuckValue::UTinyInt(i) => CellValue::Int(i.into()),
        DuckValue::USmallInt(i) => CellValue::Int(i.into()),
        DuckValue::UInt(i) => CellValue::Int(i.into()),
        DuckValue::UBigInt(i) => match i64::try_from(i) {
            Ok(small) => CellValue::Int(small),
            Err(_) => CellValue::Decimal(i.to_string()),
        },
        DuckValue::Float(f) => CellValue::Float(f.into()),
        DuckValue::Double(f) => CellValue::Float(f),
        DuckValue::Decimal(d) => CellValue::Decimal(d.to_string()),
        DuckValue::Timestamp(unit, t) => DateTime::from_timestamp_micros(to_micros(unit, t))
            .map(|dt| CellValue::Timestamp(dt.naive_utc()))
            .unwrap_or(CellValue::Null),
        DuckValue::Text(s) => CellValue::Text(s),
        DuckValue::Blob(bytes) => CellValue::Bytes(bytes),
        DuckValue::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days.into())))
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        DuckValue::Time64(unit, t) => {
            let micros = to_micros(unit, t);
            NaiveTime::from_num_seconds_from_midnight_opt(
                (micros / 1_000_000) as u32,
                ((micros % 1_000_000) * 1_000) as u32,
            )
            .map(CellValue::Time)
            .unwrap_or(CellValue::Null)
        }
        DuckValue::Interval {
            months,
            days,
            nanos,
        } => CellValue::Text(format!("{months} months {days} days {nanos} nanos")),
        DuckValue::List(items) | DuckValue::Array(items) => {
            CellValue::List(items.into_iter().map(duck_value_to_cell).collect())
        }
        DuckValue::Enum(s) => CellValue::Text(s),
        DuckValue::Struct(fields) => CellValue::Map(
            fields
                .iter()
                .map(|(key, val)| (key.clone(), duck_value_to_cell(val.clone())))
                .collect(),
        ),
        DuckValue::Map(entries) => CellValue::List(
            entries
                .iter()
                .map(|(k, v)| {
                    CellValue::List(vec![
                        duck_value_to_cell(k.clone()),
                        duck_value_to_cell(v.clone()),
                    ])
                })
                .collect(),
        ),
        DuckValue::Union(inner) => duck_value_to_cell(*inner),
    }
}
