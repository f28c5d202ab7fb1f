pub mod authz;
pub mod backends;
pub mod cache;
pub mod config;
pub mod dialect;
pub mod error;
pub mod export;
pub mod models;
pub mod normalizer;
pub mod query_builder;
pub mod query_spec;
pub mod registry;
pub mod runtime;
pub mod sql_ast;
pub mod sql_lab;
pub mod sql_parse;
pub mod telemetry;
pub mod template;
pub mod validation;

use std::path::Path;

use crate::error::Result;
use crate::registry::DatasetRegistry;

/// Load dataset definitions from disk and validate them with the provided validator.
pub async fn load_and_validate<P: AsRef<Path>>(
    root: P,
    validator: &crate::validation::Validator,
) -> Result<DatasetRegistry> {
    let registry = DatasetRegistry::load_from_dir(root)?;
    validator.validate_registry(&registry).await?;
    Ok(registry)
}

pub use crate::validation::Validator;
pub use authz::{AllowAll, Authorizer, DatabaseGrants, User};
pub use backends::{BackendConnection, BackendSession, ConnectionManager};
pub use config::SqlPilotConfig;
pub use dialect::{DialectAdapter, DialectRegistry};
pub use error::{Result as SqlPilotResult, SqlPilotError};
pub use models::{Dataset, TableColumn};
pub use normalizer::ResultSet;
pub use query_builder::{CompiledQuery, QueryCompiler};
pub use query_spec::QuerySpec;
pub use runtime::{run_chart_query, ChartQueryResult};
pub use sql_lab::{QueryPayload, QueryStatus, SqlLab, SqlLabRequest};
