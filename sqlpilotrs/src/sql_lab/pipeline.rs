//! The SQL Lab execution pipeline: submission, execution, completion and
//! retrieval of ad-hoc queries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::authz::{AllowAll, Authorizer, User};
use crate::backends::{BackendSession, ConnectionManager};
use crate::cache::{compress_payload, decompress_payload, InMemoryResultsBackend, ResultsBackend};
use crate::config::{SqlLabConfig, SqlPilotConfig};
use crate::dialect::{trailing_limit, DialectAdapter};
use crate::error::{Result, SqlPilotError};
use crate::normalizer::{normalize, RawResult, ResultSet};
use crate::sql_parse::{as_create_table, is_readonly, is_select, split_statements};
use crate::template::{TemplateContext, TemplateProcessor};

use super::query::{Query, QueryId, QueryPayload, QueryStatus, SqlLabRequest};
use super::scheduler::{SqlTask, TaskJob, TaskScheduler, TokioTaskScheduler};
use super::store::QueryStore;

pub const STOPPED_MESSAGE: &str = "The query has been stopped";
pub const LOOKUP_FAILED_MESSAGE: &str = "Failed at getting query";

fn soft_timeout_message(secs: u64) -> String {
    format!("SQL Lab timeout. This environment's policy is to kill queries after {secs} seconds.")
}

fn wall_clock_timeout_message(secs: u64) -> String {
    format!("Query exceeded the synchronous wall-clock limit of {secs} seconds.")
}

fn dispatch_failure_message(err: &SqlPilotError) -> String {
    format!(
        "Failed to start remote query on a worker: {err}. Tell your administrator to verify \
         the availability of the task queue."
    )
}

/// Why a statement did not produce a result.
enum StatementError {
    TimedOut,
    Failed(String),
}

#[derive(Clone)]
pub struct SqlLab {
    connections: Arc<ConnectionManager>,
    store: Arc<dyn QueryStore>,
    scheduler: Arc<dyn TaskScheduler>,
    results: Option<Arc<dyn ResultsBackend>>,
    authorizer: Arc<dyn Authorizer>,
    config: SqlPilotConfig,
}

impl SqlLab {
    pub fn new(
        connections: Arc<ConnectionManager>,
        store: Arc<dyn QueryStore>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        let config = connections.config().cloned().unwrap_or_default();
        Self {
            connections,
            store,
            scheduler,
            results: None,
            authorizer: Arc::new(AllowAll),
            config,
        }
    }

    /// Wire the in-process scheduler and, when enabled, an in-memory
    /// results backend from the manager's configuration.
    pub fn from_config(connections: Arc<ConnectionManager>, store: Arc<dyn QueryStore>) -> Self {
        let config = connections.config().cloned().unwrap_or_default();
        let scheduler = Arc::new(TokioTaskScheduler::from_config(&config.defaults.sql_lab));
        let lab = Self::new(connections, store, scheduler);
        if config.defaults.results_backend.enabled {
            let backend = InMemoryResultsBackend::new(&config.defaults.results_backend);
            lab.with_results_backend(Arc::new(backend))
        } else {
            lab
        }
    }

    pub fn with_results_backend(mut self, backend: Arc<dyn ResultsBackend>) -> Self {
        self.results = Some(backend);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn store(&self) -> &Arc<dyn QueryStore> {
        &self.store
    }

    fn lab_config(&self, database: &str) -> SqlLabConfig {
        self.connections.config_for(database).sql_lab
    }

    fn store_results_enabled(&self) -> bool {
        self.results.is_some()
    }

    /// Accept a submission. Async submissions return as soon as the task is
    /// dispatched; synchronous ones run inline under the wall-clock limit.
    pub async fn submit(&self, request: SqlLabRequest, user: &User) -> Result<QueryPayload> {
        let database = request.database_id.clone();
        self.connections.require(&database)?;
        self.authorizer.authorize_database(user, &database).await?;
        let lab = self.lab_config(&database);

        if let Some(client_id) = request.client_id.as_deref() {
            if let Some(existing) = self.store.find_by_client_id(client_id).await? {
                if !existing.status.is_terminal() {
                    tracing::info!(
                        query_id = existing.id,
                        client_id,
                        "query already in flight for client id"
                    );
                    return Ok(QueryPayload::from_query(&existing));
                }
            }
        }

        let context = TemplateContext {
            username: Some(user.username.clone()),
            user_id: Some(user.id),
            ..TemplateContext::default()
        }
        .with_params(request.template_params()?);
        let rendered_sql = TemplateProcessor::expand(&request.sql, &context)?;

        let status = if request.run_async {
            QueryStatus::Pending
        } else {
            QueryStatus::Running
        };
        let mut query = Query::new(user.id, &user.username, &database, &request.sql, status);
        query.schema = request.schema.clone();
        query.client_id = request.client_id.clone();
        query.limit = split_statements(&request.sql)
            .last()
            .and_then(|statement| trailing_limit(statement));
        query.select_as_cta = request.select_as_cta;
        if request.select_as_cta {
            let table = request.tmp_table_name.clone().unwrap_or_else(|| {
                format!(
                    "tmp_{}_table_{}",
                    user.id,
                    query.start_time.format("%Y_%m_%d_%H_%M_%S")
                )
            });
            query.tmp_table_name = Some(match &lab.ctas_schema {
                Some(schema) if !table.contains('.') => format!("{schema}.{table}"),
                _ => table,
            });
        }
        if !request.run_async {
            query.start_running_time = Some(query.start_time);
        }

        let query = self.store.insert(query).await?;
        tracing::info!(
            query_id = query.id,
            database = %database,
            run_async = request.run_async,
            "sql lab query submitted"
        );

        if request.run_async {
            self.dispatch(query, rendered_sql, &lab).await
        } else {
            self.run_sync(query, rendered_sql, &lab).await
        }
    }

    async fn dispatch(
        &self,
        query: Query,
        rendered_sql: String,
        lab: &SqlLabConfig,
    ) -> Result<QueryPayload> {
        let task = SqlTask {
            query_id: query.id,
            rendered_sql,
            store_results: self.store_results_enabled() && !query.select_as_cta,
            soft_limit_secs: lab.async_time_limit_secs,
        };
        let runner = self.clone();
        let job_task = task.clone();
        let job: TaskJob =
            Box::new(move |cancel| Box::pin(async move { runner.execute_task(job_task, cancel).await }));

        match self.scheduler.submit(&task, job) {
            Ok(_handle) => {
                tracing::debug!(query_id = query.id, "query dispatched to worker");
                Ok(QueryPayload::from_query(&query))
            }
            Err(err) => {
                tracing::error!(query_id = query.id, error = %err, "failed to dispatch query");
                let message = dispatch_failure_message(&err);
                self.finish_with_error(query.id, QueryStatus::Failed, message, lab)
                    .await
            }
        }
    }

    async fn run_sync(
        &self,
        query: Query,
        rendered_sql: String,
        lab: &SqlLabConfig,
    ) -> Result<QueryPayload> {
        let task = SqlTask {
            query_id: query.id,
            rendered_sql,
            store_results: false,
            soft_limit_secs: lab.soft_timeout_secs,
        };
        let cancel = CancellationToken::new();
        let watchdog = {
            let token = cancel.clone();
            let soft = lab.soft_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(soft).await;
                token.cancel();
            })
        };

        let execution = self.execute_task(task, cancel.clone());
        let outcome = tokio::time::timeout(lab.sync_timeout(), execution).await;
        watchdog.abort();
        match outcome {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                tracing::warn!(query_id = query.id, "synchronous query hit wall-clock limit");
                let message = wall_clock_timeout_message(lab.sync_timeout_secs);
                self.finish_with_error(query.id, QueryStatus::TimedOut, message, lab)
                    .await
            }
        }
    }

    /// Re-read a freshly written row, tolerating a lagging store.
    pub async fn get_query_with_retry(&self, query_id: QueryId) -> Result<Query> {
        let lab = &self.config.defaults.sql_lab;
        let attempts = lab.lookup_retry_count.max(1);
        for attempt in 1..=attempts {
            match self.store.get(query_id).await {
                Ok(Some(query)) => return Ok(query),
                Ok(None) => {
                    tracing::error!(query_id, attempt, "query could not be retrieved")
                }
                Err(e) => {
                    tracing::error!(query_id, attempt, error = %e, "query lookup failed")
                }
            }
            if attempt < attempts {
                tokio::time::sleep(lab.lookup_backoff()).await;
            }
        }
        Err(SqlPilotError::SqlLab(LOOKUP_FAILED_MESSAGE.to_string()))
    }

    /// Worker entry point. Failures that escape [`SqlLab::run`] are still
    /// recorded on the row before they propagate.
    pub async fn execute_task(
        &self,
        task: SqlTask,
        cancel: CancellationToken,
    ) -> Result<QueryPayload> {
        let query_id = task.query_id;
        let err = match self.run(task, cancel).await {
            Ok(payload) => return Ok(payload),
            Err(err) => err,
        };
        tracing::error!(query_id, error = %err, "unhandled sql lab failure");
        let message = err.to_string();
        let recorded = self
            .store
            .modify(
                query_id,
                Box::new(move |q| {
                    q.status = QueryStatus::Failed;
                    q.error_message = Some(message);
                    q.tmp_table_name = None;
                    q.end_time = Some(Utc::now());
                }),
            )
            .await;
        if let Err(e) = recorded {
            tracing::error!(query_id, error = %e, "could not record failure on query row");
        }
        Err(err)
    }

    /// Execute a task end to end. Execution failures end in a persisted
    /// terminal state and an `Ok` payload; only infrastructure failures
    /// surface as `Err`.
    pub async fn run(&self, task: SqlTask, cancel: CancellationToken) -> Result<QueryPayload> {
        let query = self.get_query_with_retry(task.query_id).await?;
        let lab = self.lab_config(&query.database);

        if task.store_results && self.results.is_none() {
            return self
                .finish_with_error(
                    query.id,
                    QueryStatus::Failed,
                    "Results backend isn't configured.".to_string(),
                    &lab,
                )
                .await;
        }

        let started = Utc::now();
        let mut query = self
            .store
            .modify(
                query.id,
                Box::new(move |q| {
                    if q.status != QueryStatus::Stopped {
                        q.status = QueryStatus::Running;
                    }
                    q.start_running_time = Some(started);
                }),
            )
            .await?;

        let conn = self.connections.require(&query.database)?;
        let dialect = self.connections.dialect_for(&query.database)?;
        let statements = split_statements(&task.rendered_sql);
        if statements.is_empty() {
            return self
                .finish_with_error(
                    query.id,
                    QueryStatus::Failed,
                    "No SQL statement to execute".to_string(),
                    &lab,
                )
                .await;
        }

        let mut session = match conn.open_session(query.schema.as_deref()).await {
            Ok(session) => session,
            Err(e) => {
                let message = dialect.extract_error_message(&e.to_string());
                return self
                    .finish_with_error(query.id, QueryStatus::Failed, message, &lab)
                    .await;
            }
        };

        let timer = Instant::now();
        let total = statements.len();
        let mut executed = Vec::with_capacity(total);
        let mut last: Option<RawResult> = None;
        for (idx, statement) in statements.iter().enumerate() {
            let is_last = idx + 1 == total;
            let sql = match self.prepare_statement(&mut query, statement, is_last, &lab, dialect.as_ref()) {
                Ok(sql) => sql,
                Err(message) => {
                    close_session(session).await;
                    return self
                        .finish_with_error(query.id, QueryStatus::Failed, message, &lab)
                        .await;
                }
            };
            tracing::debug!(query_id = query.id, statement = idx + 1, total, "executing statement");

            match execute_statement(session.as_mut(), &sql, &cancel, dialect.as_ref()).await {
                Ok(result) => last = Some(result),
                Err(StatementError::TimedOut) => {
                    tracing::warn!(query_id = query.id, "query cancelled by soft time limit");
                    close_session(session).await;
                    return self
                        .finish_with_error(
                            query.id,
                            QueryStatus::TimedOut,
                            soft_timeout_message(task.soft_limit_secs),
                            &lab,
                        )
                        .await;
                }
                Err(StatementError::Failed(message)) => {
                    tracing::warn!(query_id = query.id, error = %message, "statement failed");
                    close_session(session).await;
                    return self
                        .finish_with_error(query.id, QueryStatus::Failed, message, &lab)
                        .await;
                }
            }
            executed.push(sql);

            if total > 1 && !is_last {
                let progress = ((idx + 1) * 100 / total) as u8;
                self.store
                    .modify(query.id, Box::new(move |q| q.progress = progress))
                    .await?;
            }
        }
        close_session(session).await;
        tracing::info!(
            query_id = query.id,
            statements = total,
            ms = timer.elapsed().as_millis(),
            "sql lab query executed"
        );

        if self.is_stopped(query.id).await? {
            return self.stopped_payload(query.id).await;
        }

        let raw = last.unwrap_or_default();
        let results = normalize(&raw.columns, raw.rows);
        let rows = results.size;
        let executed_sql = executed.join(";\n");
        let select_sql = match (query.select_as_cta_used, &query.tmp_table_name) {
            (true, Some(table)) => {
                let (schema, name) = split_table_name(table);
                Some(dialect.select_star(name, schema, query.limit))
            }
            _ => None,
        };
        let limit = query.limit;
        let cta_used = query.select_as_cta_used;
        let ended = Utc::now();

        let mut completed = self
            .store
            .modify(
                query.id,
                Box::new(move |q| {
                    if q.status == QueryStatus::Stopped {
                        q.error_message = Some(STOPPED_MESSAGE.to_string());
                        return;
                    }
                    q.rows = Some(rows);
                    q.progress = 100;
                    q.status = QueryStatus::Success;
                    q.limit = limit;
                    q.select_as_cta_used = cta_used;
                    q.select_sql = select_sql;
                    q.executed_sql = Some(executed_sql);
                    q.end_time = Some(ended);
                }),
            )
            .await?;
        if completed.status == QueryStatus::Stopped {
            return Ok(QueryPayload::from_query(&completed));
        }

        let mut payload = QueryPayload::from_query(&completed).with_results(results);
        if task.store_results {
            if let Some(backend) = &self.results {
                let key = uuid::Uuid::new_v4().to_string();
                let ttl = self.connections.config_for(&completed.database).results_ttl;
                let mut stored = payload.clone();
                if let Some(q) = stored.query.as_mut() {
                    q.results_key = Some(key.clone());
                }
                backend.set(&key, compress_payload(&stored)?, ttl).await?;
                tracing::info!(query_id = completed.id, key = %key, "stored results in results backend");

                let stored_at = Utc::now();
                let results_key = key.clone();
                completed = self
                    .store
                    .modify(
                        completed.id,
                        Box::new(move |q| {
                            q.results_key = Some(results_key);
                            q.end_result_backend_time = Some(stored_at);
                        }),
                    )
                    .await?;
                payload.query = Some(completed);
            }
        }
        Ok(payload)
    }

    /// Apply CTA, DML and row-cap rules to one statement. Only the final
    /// statement produces rows, so only it is capped.
    fn prepare_statement(
        &self,
        query: &mut Query,
        statement: &str,
        is_last: bool,
        lab: &SqlLabConfig,
        dialect: &dyn DialectAdapter,
    ) -> std::result::Result<String, String> {
        let select = is_select(statement);
        if !select && !lab.allow_dml && !is_readonly(statement) {
            return Err("Only `SELECT` statements are allowed against this database".to_string());
        }
        if query.select_as_cta && is_last {
            if !select {
                return Err(
                    "Only `SELECT` statements can be used with the CREATE TABLE feature."
                        .to_string(),
                );
            }
            let table = query
                .tmp_table_name
                .clone()
                .ok_or_else(|| "CREATE TABLE AS requires a target table name".to_string())?;
            query.select_as_cta_used = true;
            return Ok(as_create_table(&table, statement, false));
        }
        if select && is_last {
            let own = trailing_limit(statement);
            query.limit = own;
            if let Some(ceiling) = lab.row_ceiling() {
                if own.map_or(true, |limit| limit > ceiling) {
                    query.limit = Some(ceiling);
                    return Ok(dialect.apply_limit(statement, ceiling));
                }
            }
        }
        Ok(statement.to_string())
    }

    async fn is_stopped(&self, query_id: QueryId) -> Result<bool> {
        Ok(self
            .store
            .get(query_id)
            .await?
            .is_some_and(|q| q.status == QueryStatus::Stopped))
    }

    async fn stopped_payload(&self, query_id: QueryId) -> Result<QueryPayload> {
        let query = self
            .store
            .modify(
                query_id,
                Box::new(|q| {
                    q.error_message = Some(STOPPED_MESSAGE.to_string());
                    q.tmp_table_name = None;
                }),
            )
            .await?;
        tracing::info!(query_id, "query stopped, discarding results");
        Ok(QueryPayload::from_query(&query))
    }

    /// Persist a terminal error state and build the matching payload.
    async fn finish_with_error(
        &self,
        query_id: QueryId,
        status: QueryStatus,
        message: String,
        lab: &SqlLabConfig,
    ) -> Result<QueryPayload> {
        let ended = Utc::now();
        let error = message.clone();
        let query = self
            .store
            .modify(
                query_id,
                Box::new(move |q| {
                    q.status = status;
                    q.error_message = Some(error);
                    q.tmp_table_name = None;
                    q.end_time = Some(ended);
                }),
            )
            .await?;
        Ok(QueryPayload::from_query(&query).with_link(lab.troubleshooting_link.clone()))
    }

    /// Request a stop. Observed once, after execution returns.
    pub async fn stop(&self, query_id: QueryId) -> Result<()> {
        self.store
            .modify(query_id, Box::new(|q| q.status = QueryStatus::Stopped))
            .await?;
        tracing::info!(query_id, "stop requested");
        Ok(())
    }

    /// Current row state; never includes result rows.
    pub async fn status(&self, query_id: QueryId) -> Result<QueryPayload> {
        let query = self
            .store
            .get(query_id)
            .await?
            .ok_or_else(|| SqlPilotError::NotFound(format!("query {query_id}")))?;
        let mut payload = QueryPayload::from_query(&query);
        if query.status == QueryStatus::Stopped && payload.error.is_none() {
            payload.error = Some(STOPPED_MESSAGE.to_string());
        }
        Ok(payload)
    }

    /// Current row state of the query submitted under `client_id`.
    pub async fn status_by_client_id(&self, client_id: &str) -> Result<QueryPayload> {
        let query = self
            .store
            .find_by_client_id(client_id)
            .await?
            .ok_or_else(|| SqlPilotError::NotFound(format!("query for client {client_id}")))?;
        self.status(query.id).await
    }

    /// Replay a stored payload. Stopped queries never hand out rows.
    pub async fn fetch_results(&self, key: &str) -> Result<QueryPayload> {
        let backend = self
            .results
            .as_ref()
            .ok_or_else(|| SqlPilotError::SqlLab("Results backend isn't configured.".to_string()))?;
        let blob = backend
            .get(key)
            .await?
            .ok_or_else(|| SqlPilotError::ResultsExpired(key.to_string()))?;
        let payload: QueryPayload = decompress_payload(&blob)?;
        if self.is_stopped(payload.query_id).await? {
            return self.status(payload.query_id).await;
        }
        Ok(payload)
    }

    /// First rows of a table, bounded by the database's row ceiling and the
    /// synchronous wall clock.
    pub async fn preview(
        &self,
        database: &str,
        table: &str,
        schema: Option<&str>,
        limit: u64,
        user: &User,
    ) -> Result<ResultSet> {
        let conn = self.connections.require(database)?;
        self.authorizer.authorize_database(user, database).await?;
        let dialect = self.connections.dialect_for(database)?;
        let limit = match self.lab_config(database).row_ceiling() {
            Some(ceiling) => limit.min(ceiling),
            None => limit,
        };
        let sql = dialect.select_star(table, schema, Some(limit));
        tracing::debug!(database, sql = %sql, "table preview");
        let wall_clock = self.lab_config(database).sync_timeout_secs;
        let raw = tokio::time::timeout(Duration::from_secs(wall_clock), conn.execute_sql(&sql))
            .await
            .map_err(|_| SqlPilotError::Timeout(wall_clock_timeout_message(wall_clock)))??;
        Ok(normalize(&raw.columns, raw.rows))
    }
}

async fn execute_statement(
    session: &mut dyn BackendSession,
    sql: &str,
    cancel: &CancellationToken,
    dialect: &dyn DialectAdapter,
) -> std::result::Result<RawResult, StatementError> {
    if cancel.is_cancelled() {
        return Err(StatementError::TimedOut);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StatementError::TimedOut),
        result = session.execute(sql) => {
            result.map_err(|e| StatementError::Failed(dialect.extract_error_message(&e.to_string())))
        }
    }
}

async fn close_session(session: Box<dyn BackendSession>) {
    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "failed to close backend session");
    }
}

/// `schema.table` into its parts.
fn split_table_name(name: &str) -> (Option<&str>, &str) {
    match name.rsplit_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_qualified_table_names() {
        assert_eq!(split_table_name("lab.tmp_1"), (Some("lab"), "tmp_1"));
        assert_eq!(split_table_name("tmp_1"), (None, "tmp_1"));
    }

    #[test]
    fn timeout_messages_are_distinct() {
        assert_eq!(
            soft_timeout_message(600),
            "SQL Lab timeout. This environment's policy is to kill queries after 600 seconds."
        );
        assert_ne!(soft_timeout_message(5), wall_clock_timeout_message(5));
    }
}
