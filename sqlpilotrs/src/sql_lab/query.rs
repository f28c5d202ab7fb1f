//! The tracked Query row and the payloads SQL Lab hands back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SqlPilotError};
use crate::normalizer::{ColumnInfo, ResultSet};

pub type QueryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Running,
    Success,
    Failed,
    TimedOut,
    Stopped,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, QueryStatus::Pending | QueryStatus::Running)
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Running => "running",
            QueryStatus::Success => "success",
            QueryStatus::Failed => "failed",
            QueryStatus::TimedOut => "timed_out",
            QueryStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    pub user_id: i64,
    pub username: String,
    pub database: String,
    pub schema: Option<String>,
    /// SQL exactly as submitted, before template expansion.
    pub sql: String,
    pub client_id: Option<String>,
    pub status: QueryStatus,
    pub progress: u8,
    pub rows: Option<usize>,
    /// Effective row limit; starts as the statement's own trailing LIMIT.
    pub limit: Option<u64>,
    pub select_as_cta: bool,
    pub select_as_cta_used: bool,
    pub tmp_table_name: Option<String>,
    /// Statement that reads back a CTA target.
    pub select_sql: Option<String>,
    pub executed_sql: Option<String>,
    pub results_key: Option<String>,
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub start_running_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub end_result_backend_time: Option<DateTime<Utc>>,
}

impl Query {
    /// A new row; the store assigns `id` on insert.
    pub fn new(
        user_id: i64,
        username: impl Into<String>,
        database: impl Into<String>,
        sql: impl Into<String>,
        status: QueryStatus,
    ) -> Self {
        Self {
            id: 0,
            user_id,
            username: username.into(),
            database: database.into(),
            schema: None,
            sql: sql.into(),
            client_id: None,
            status,
            progress: 0,
            rows: None,
            limit: None,
            select_as_cta: false,
            select_as_cta_used: false,
            tmp_table_name: None,
            select_sql: None,
            executed_sql: None,
            results_key: None,
            error_message: None,
            start_time: Utc::now(),
            start_running_time: None,
            end_time: None,
            end_result_backend_time: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.start_running_time.unwrap_or(self.start_time);
        self.end_time
            .map(|end| end.signed_duration_since(started).num_milliseconds())
    }
}

/// Body of a SQL Lab submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlLabRequest {
    pub sql: String,
    /// Name of the connection the SQL runs on.
    pub database_id: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub select_as_cta: bool,
    #[serde(default)]
    pub tmp_table_name: Option<String>,
    #[serde(default, rename = "runAsync")]
    pub run_async: bool,
    #[serde(default)]
    pub client_id: Option<String>,
    /// JSON object, or a string holding one.
    #[serde(default, rename = "templateParams")]
    pub template_params: Option<Value>,
}

impl SqlLabRequest {
    pub fn new(database: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            database_id: database.into(),
            ..Self::default()
        }
    }

    pub fn run_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }

    pub fn template_params(&self) -> Result<Map<String, Value>> {
        match &self.template_params {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(Map::new()),
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(SqlPilotError::Template(
                    "templateParams must be a JSON object".to_string(),
                )),
                Err(e) => Err(SqlPilotError::Template(format!("invalid templateParams: {e}"))),
            },
            Some(_) => Err(SqlPilotError::Template(
                "templateParams must be a JSON object".to_string(),
            )),
        }
    }
}

/// What status polls, synchronous runs and results retrieval return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    pub query_id: QueryId,
    pub status: QueryStatus,
    #[serde(default)]
    pub data: Vec<Map<String, Value>>,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    pub query: Option<Query>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl QueryPayload {
    /// Row state without any result rows.
    pub fn from_query(query: &Query) -> Self {
        Self {
            query_id: query.id,
            status: query.status,
            data: Vec::new(),
            columns: Vec::new(),
            query: Some(query.clone()),
            error: query.error_message.clone(),
            link: None,
        }
    }

    pub fn with_results(mut self, results: ResultSet) -> Self {
        self.data = results.data;
        self.columns = results.columns;
        self
    }

    pub fn with_link(mut self, link: Option<String>) -> Self {
        self.link = link;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(QueryStatus::TimedOut).unwrap(),
            json!("timed_out")
        );
        assert_eq!(QueryStatus::Pending.to_string(), "pending");
        assert!(QueryStatus::Stopped.is_terminal());
        assert!(!QueryStatus::Running.is_terminal());
    }

    #[test]
    fn request_accepts_wire_names() {
        let req: SqlLabRequest = serde_json::from_value(json!({
            "sql": "SELECT {{ x }}",
            "database_id": "main",
            "runAsync": true,
            "templateParams": "{\"x\": 1}"
        }))
        .unwrap();
        assert!(req.run_async);
        assert_eq!(req.template_params().unwrap()["x"], json!(1));
    }

    #[test]
    fn template_params_must_be_an_object() {
        let mut req = SqlLabRequest::new("main", "SELECT 1");
        req.template_params = Some(json!("[1, 2]"));
        assert!(matches!(
            req.template_params(),
            Err(SqlPilotError::Template(_))
        ));
        req.template_params = Some(json!({"a": "b"}));
        assert_eq!(req.template_params().unwrap().len(), 1);
    }
}
