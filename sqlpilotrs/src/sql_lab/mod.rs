//! SQL Lab: tracked execution of ad-hoc SQL, inline or on workers.

mod pipeline;
mod query;
pub mod scheduler;
mod store;

pub use pipeline::{SqlLab, LOOKUP_FAILED_MESSAGE, STOPPED_MESSAGE};
pub use query::{Query, QueryId, QueryPayload, QueryStatus, SqlLabRequest};
pub use scheduler::{JobFuture, SqlTask, TaskHandle, TaskJob, TaskScheduler, TokioTaskScheduler};
pub use store::{InMemoryQueryStore, QueryMutation, QueryStore};
