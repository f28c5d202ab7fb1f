//! Checks registered datasets against the live catalog.

use std::sync::Mutex;

use crate::backends::ConnectionManager;
use crate::cache::{SchemaCache, TableSchema};
use crate::config::MetadataCacheConfig;
use crate::error::{Result, SqlPilotError};
use crate::models::Dataset;
use crate::registry::DatasetRegistry;

pub struct Validator {
    connections: ConnectionManager,
    cache: Mutex<SchemaCache>,
    warn_only: bool,
}

impl Validator {
    pub fn new(connections: ConnectionManager, warn_only: bool) -> Self {
        let cache_config = connections
            .config()
            .map(|c| c.defaults.metadata_cache.clone())
            .unwrap_or_default();
        Self::with_cache_config(connections, warn_only, &cache_config)
    }

    pub fn with_cache_config(
        connections: ConnectionManager,
        warn_only: bool,
        cache_config: &MetadataCacheConfig,
    ) -> Self {
        Self {
            connections,
            cache: Mutex::new(SchemaCache::with_config(cache_config)),
            warn_only,
        }
    }

    pub async fn validate_registry(&self, registry: &DatasetRegistry) -> Result<()> {
        for name in registry.names() {
            if let Some(dataset) = registry.get(name) {
                self.validate_dataset(dataset).await?;
            }
        }
        Ok(())
    }

    /// Virtual datasets are only checked for a known database; their columns
    /// come from arbitrary SQL.
    pub async fn validate_dataset(&self, dataset: &Dataset) -> Result<()> {
        let conn = self.connections.require(&dataset.database).map_err(|_| {
            SqlPilotError::Validation(format!(
                "dataset {} references unknown database {}",
                dataset.name, dataset.database
            ))
        })?;
        let Some(table) = dataset.table_name() else {
            return Ok(());
        };
        let schema = self
            .ensure_schema(&dataset.database, table, dataset.schema.as_deref(), conn)
            .await?;

        for col in dataset.columns.iter().filter(|c| c.expression.is_none()) {
            self.check(
                schema.column(&col.column_name).is_some(),
                format!(
                    "column {} of dataset {} missing from table {table}",
                    col.column_name, dataset.name
                ),
            )?;
        }
        Ok(())
    }

    async fn ensure_schema(
        &self,
        database: &str,
        table: &str,
        schema: Option<&str>,
        conn: std::sync::Arc<dyn crate::backends::BackendConnection>,
    ) -> Result<TableSchema> {
        let key = (database.to_string(), qualified(table, schema));
        if let Some(cached) = self.lock_cache()?.get(&key) {
            return Ok(cached);
        }
        let fetched = conn.fetch_schema(table, schema).await?;
        self.lock_cache()?.insert(key, fetched.clone());
        Ok(fetched)
    }

    fn lock_cache(&self) -> Result<std::sync::MutexGuard<'_, SchemaCache>> {
        self.cache
            .lock()
            .map_err(|_| SqlPilotError::Validation("schema cache poisoned".to_string()))
    }

    fn check(&self, condition: bool, message: String) -> Result<()> {
        if condition {
            return Ok(());
        }
        if self.warn_only {
            tracing::warn!(%message, "dataset validation warning");
            Ok(())
        } else {
            Err(SqlPilotError::Validation(message))
        }
    }
}

fn qualified(table: &str, schema: Option<&str>) -> String {
    match schema {
        Some(schema) => format!("{schema}.{table}"),
        None => table.to_string(),
    }
}
