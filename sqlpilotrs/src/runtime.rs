//! Chart-query execution: compile a slice request, run it, normalize.
//!
//! Execution failures are reported inside [`ChartQueryResult`] so callers can
//! still show the SQL that was attempted. Compilation and template errors are
//! returned as `Err`.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backends::ConnectionManager;
use crate::error::{Result, SqlPilotError};
use crate::normalizer::{normalize, ResultSet};
use crate::query_builder::{CompiledQuery, QueryCompiler};
use crate::query_spec::QuerySpec;
use crate::registry::DatasetRegistry;
use crate::sql_lab::QueryStatus;
use crate::template::TemplateContext;

#[derive(Debug, Clone, Serialize)]
pub struct ChartQueryResult {
    pub status: QueryStatus,
    /// Prequeries and the main statement as run.
    pub query: String,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub data: ResultSet,
}

impl ChartQueryResult {
    fn failed(status: QueryStatus, query: String, started: Instant, message: String) -> Self {
        Self {
            status,
            query,
            duration_ms: elapsed_ms(started),
            error_message: Some(message),
            data: ResultSet::default(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn is_compile_error(err: &SqlPilotError) -> bool {
    matches!(
        err,
        SqlPilotError::Compilation(_) | SqlPilotError::Template(_) | SqlPilotError::NotFound(_)
    )
}

/// Compile `spec` against the named dataset and execute it on the dataset's
/// database. A missing `row_limit` falls back to the configured default.
pub async fn run_chart_query(
    connections: &ConnectionManager,
    registry: &DatasetRegistry,
    dataset_name: &str,
    spec: &QuerySpec,
    context: TemplateContext,
) -> Result<ChartQueryResult> {
    let dataset = registry.require(dataset_name)?;
    let conn = connections.require(&dataset.database)?;
    let dialect = connections.dialect_for(&dataset.database)?;
    let settings = connections.config_for(&dataset.database).query;

    let mut spec = spec.clone();
    if spec.row_limit.is_none() && settings.default_row_limit > 0 {
        spec.row_limit = Some(settings.default_row_limit);
    }

    let started = Instant::now();
    let compiler = QueryCompiler::new(dialect.clone()).with_template_context(context);
    let compiled: CompiledQuery = match compiler.compile(&spec, dataset, &conn).await {
        Ok(compiled) => compiled,
        Err(e) if is_compile_error(&e) => return Err(e),
        Err(e) => {
            tracing::warn!(dataset = dataset_name, error = %e, "prequery failed");
            let message = dialect.extract_error_message(&e.to_string());
            return Ok(ChartQueryResult::failed(
                QueryStatus::Failed,
                String::new(),
                started,
                message,
            ));
        }
    };
    let display_sql = compiled.display_sql();
    tracing::debug!(dataset = dataset_name, sql = %display_sql, "running chart query");

    let execution = conn.execute_sql(&compiled.sql);
    let outcome = if settings.timeout_ms > 0 {
        match tokio::time::timeout(Duration::from_millis(settings.timeout_ms), execution).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    dataset = dataset_name,
                    timeout_ms = settings.timeout_ms,
                    "chart query timed out"
                );
                return Ok(ChartQueryResult::failed(
                    QueryStatus::TimedOut,
                    display_sql,
                    started,
                    SqlPilotError::Timeout(format!("Query timed out after {} ms", settings.timeout_ms))
                        .to_string(),
                ));
            }
        }
    } else {
        execution.await
    };

    match outcome {
        Ok(raw) => {
            let data = normalize(&raw.columns, raw.rows);
            let ms = elapsed_ms(started);
            tracing::info!(dataset = dataset_name, rows = data.size, ms, "chart query finished");
            Ok(ChartQueryResult {
                status: QueryStatus::Success,
                query: display_sql,
                duration_ms: ms,
                error_message: None,
                data,
            })
        }
        Err(e) => {
            tracing::warn!(dataset = dataset_name, error = %e, "chart query failed");
            let message = dialect.extract_error_message(&e.to_string());
            Ok(ChartQueryResult::failed(
                QueryStatus::Failed,
                display_sql,
                started,
                message,
            ))
        }
    }
}
