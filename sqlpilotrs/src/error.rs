use thiserror::Error;

pub type Result<T> = std::result::Result<T, SqlPilotError>;

#[derive(Debug, Error)]
pub enum SqlPilotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    /// Unknown metric/dimension, missing time column, empty query.
    #[error("{0}")]
    Compilation(String),
    #[error("template rendering failed: {0}")]
    Template(String),
    /// Driver-level failure; the message is already dialect-extracted.
    #[error("{0}")]
    Execution(String),
    #[error("{0}")]
    Timeout(String),
    /// The task queue could not accept the work.
    #[error("{0}")]
    Dispatch(String),
    /// Infrastructure failure inside the pipeline, e.g. the query row never
    /// became visible.
    #[error("sql lab error: {0}")]
    SqlLab(String),
    #[error("Data could not be retrieved. You may want to re-run the query.")]
    ResultsExpired(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SqlPilotError {
    /// HTTP-like status code for surfacing the error to a web caller.
    pub fn status_code(&self) -> u16 {
        match self {
            SqlPilotError::Compilation(_)
            | SqlPilotError::Template(_)
            | SqlPilotError::Validation(_) => 400,
            SqlPilotError::Permission(_) => 403,
            SqlPilotError::NotFound(_) => 404,
            SqlPilotError::Timeout(_) => 408,
            SqlPilotError::ResultsExpired(_) => 410,
            SqlPilotError::Dispatch(_) => 503,
            _ => 500,
        }
    }

    /// True when the failure stems from the request rather than the platform.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            SqlPilotError::Compilation(_)
                | SqlPilotError::Template(_)
                | SqlPilotError::Validation(_)
                | SqlPilotError::Execution(_)
                | SqlPilotError::Timeout(_)
                | SqlPilotError::Permission(_)
                | SqlPilotError::ResultsExpired(_)
        )
    }
}
