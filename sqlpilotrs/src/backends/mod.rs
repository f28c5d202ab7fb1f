//! Database backend implementations.
//!
//! Each backend is implemented in its own file and gated behind a feature flag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::TableSchema;
use crate::config::{ResolvedDatabaseConfig, SqlPilotConfig};
use crate::dialect::{DialectAdapter, DialectRegistry};
use crate::error::{Result, SqlPilotError};
use crate::normalizer::RawResult;
use crate::query_builder::PrequeryRunner;

/// Unified interface for all database backends.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Identifier the dialect adapter is looked up by.
    fn engine(&self) -> &str;

    async fn fetch_schema(&self, table: &str, schema: Option<&str>) -> Result<TableSchema>;

    /// Run one statement on a pooled connection.
    async fn execute_sql(&self, sql: &str) -> Result<RawResult>;

    /// Open a dedicated, non-pooled session; SQL Lab runs every statement of
    /// one query on the same session.
    async fn open_session(&self, schema: Option<&str>) -> Result<Box<dyn BackendSession>>;
}

/// A single backend connection owned by one running query.
#[async_trait]
pub trait BackendSession: Send {
    async fn execute(&mut self, sql: &str) -> Result<RawResult>;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
impl PrequeryRunner for Arc<dyn BackendConnection> {
    async fn run_prequery(&self, sql: &str) -> Result<RawResult> {
        self.execute_sql(sql).await
    }
}

/// Connections keyed by database name, with their dialects and config.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: HashMap<String, Arc<dyn BackendConnection>>,
    dialects: DialectRegistry,
    config: Option<SqlPilotConfig>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connection manager with configuration.
    pub fn with_config(config: SqlPilotConfig) -> Self {
        Self {
            config: Some(config),
            ..Self::default()
        }
    }

    pub fn with_dialects(mut self, dialects: DialectRegistry) -> Self {
        self.dialects = dialects;
        self
    }

    pub fn config(&self) -> Option<&SqlPilotConfig> {
        self.config.as_ref()
    }

    /// Resolved configuration for a specific database.
    pub fn config_for(&self, name: &str) -> ResolvedDatabaseConfig {
        match &self.config {
            Some(cfg) => cfg.for_database(name),
            None => SqlPilotConfig::default().for_database(name),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, conn: Arc<dyn BackendConnection>) {
        self.connections.insert(name.into(), conn);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn BackendConnection>> {
        self.connections.get(name)
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn BackendConnection>> {
        self.get(name)
            .cloned()
            .ok_or_else(|| SqlPilotError::NotFound(format!("database {name} not registered")))
    }

    pub fn dialect_for(&self, name: &str) -> Result<Arc<dyn DialectAdapter>> {
        let conn = self.require(name)?;
        Ok(self.dialects.get(conn.engine()))
    }

    pub fn dialects(&self) -> &DialectRegistry {
        &self.dialects
    }
}

// Feature-gated backend implementations
#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::DuckDbConnection;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresConnection;
