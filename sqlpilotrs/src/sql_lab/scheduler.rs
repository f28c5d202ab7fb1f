//! Worker boundary for asynchronous SQL Lab queries.
//!
//! A scheduler receives a [`SqlTask`] plus the job that executes it. The
//! in-process [`TokioTaskScheduler`] runs jobs on the tokio runtime with a
//! bounded worker pool; other implementations can hand the task off to a
//! remote queue instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SqlPilotError};

use super::query::{QueryId, QueryPayload};

/// What a worker needs to run one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlTask {
    pub query_id: QueryId,
    /// SQL after template expansion.
    pub rendered_sql: String,
    pub store_results: bool,
    /// Cooperative time limit reported in the timeout message.
    pub soft_limit_secs: u64,
}

pub type JobFuture = Pin<Box<dyn Future<Output = Result<QueryPayload>> + Send + 'static>>;

/// The work bound to a task; receives the task's cancellation token.
pub type TaskJob = Box<dyn FnOnce(CancellationToken) -> JobFuture + Send + 'static>;

pub trait TaskScheduler: Send + Sync {
    /// Accept the task or fail with [`SqlPilotError::Dispatch`].
    fn submit(&self, task: &SqlTask, job: TaskJob) -> Result<TaskHandle>;
}

/// Completion handle for a dispatched task.
#[derive(Debug)]
pub struct TaskHandle {
    query_id: QueryId,
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<QueryPayload>>,
}

impl TaskHandle {
    pub fn new(
        query_id: QueryId,
        cancel: CancellationToken,
        done: oneshot::Receiver<Result<QueryPayload>>,
    ) -> Self {
        Self {
            query_id,
            cancel,
            done,
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Trip the task's cancellation token early.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<QueryPayload> {
        self.done.await.map_err(|_| {
            SqlPilotError::SqlLab(format!("worker for query {} went away", self.query_id))
        })?
    }
}

/// Runs tasks on the current tokio runtime, at most `max_concurrent` at once.
pub struct TokioTaskScheduler {
    workers: Arc<Semaphore>,
    time_limit: Duration,
    closed: AtomicBool,
}

impl TokioTaskScheduler {
    pub fn new(max_concurrent: usize, time_limit: Duration) -> Self {
        tracing::info!(
            max_concurrent,
            time_limit_secs = time_limit.as_secs(),
            "creating SQL Lab task scheduler"
        );
        Self {
            workers: Arc::new(Semaphore::new(max_concurrent.max(1))),
            time_limit,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &crate::config::SqlLabConfig) -> Self {
        Self::new(config.max_concurrent_tasks, config.async_time_limit())
    }

    /// Stop accepting work; running tasks finish normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.workers.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TaskScheduler for TokioTaskScheduler {
    fn submit(&self, task: &SqlTask, job: TaskJob) -> Result<TaskHandle> {
        if self.is_closed() {
            return Err(SqlPilotError::Dispatch(
                "task scheduler is closed".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SqlPilotError::Dispatch(format!("no runtime available: {e}")))?;

        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let workers = self.workers.clone();
        let token = cancel.clone();
        let time_limit = self.time_limit;
        let query_id = task.query_id;

        runtime.spawn(async move {
            let permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = tx.send(Err(SqlPilotError::Dispatch(
                        "task scheduler closed before the task started".to_string(),
                    )));
                    return;
                }
            };
            tracing::debug!(query_id, "worker picked up query");

            let watchdog = {
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(time_limit).await;
                    tracing::warn!(query_id, "soft time limit reached, cancelling query");
                    token.cancel();
                })
            };
            let result = job(token).await;
            watchdog.abort();
            drop(permit);

            if let Err(e) = &result {
                tracing::error!(query_id, error = %e, "query task failed");
            }
            let _ = tx.send(result);
        });

        Ok(TaskHandle::new(query_id, cancel, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_lab::QueryStatus;

    fn task(id: QueryId) -> SqlTask {
        SqlTask {
            query_id: id,
            rendered_sql: "SELECT 1".to_string(),
            store_results: false,
            soft_limit_secs: 1,
        }
    }

    fn payload(id: QueryId, status: QueryStatus) -> QueryPayload {
        QueryPayload {
            query_id: id,
            status,
            data: Vec::new(),
            columns: Vec::new(),
            query: None,
            error: None,
            link: None,
        }
    }

    #[tokio::test]
    async fn runs_job_and_returns_payload() {
        let scheduler = TokioTaskScheduler::new(2, Duration::from_secs(60));
        let handle = scheduler
            .submit(
                &task(7),
                Box::new(|_cancel| Box::pin(async { Ok(payload(7, QueryStatus::Success)) })),
            )
            .unwrap();
        assert_eq!(handle.query_id(), 7);
        let out = handle.wait().await.unwrap();
        assert_eq!(out.status, QueryStatus::Success);
    }

    #[tokio::test]
    async fn cancels_token_after_time_limit() {
        let scheduler = TokioTaskScheduler::new(1, Duration::from_millis(20));
        let handle = scheduler
            .submit(
                &task(1),
                Box::new(|cancel| {
                    Box::pin(async move {
                        cancel.cancelled().await;
                        Ok(payload(1, QueryStatus::TimedOut))
                    })
                }),
            )
            .unwrap();
        let out = handle.wait().await.unwrap();
        assert_eq!(out.status, QueryStatus::TimedOut);
    }

    #[tokio::test]
    async fn closed_scheduler_rejects_tasks() {
        let scheduler = TokioTaskScheduler::new(1, Duration::from_secs(1));
        scheduler.close();
        let err = scheduler
            .submit(
                &task(1),
                Box::new(|_| Box::pin(async { Ok(payload(1, QueryStatus::Success)) })),
            )
            .unwrap_err();
        assert!(matches!(err, SqlPilotError::Dispatch(_)));
    }
}
