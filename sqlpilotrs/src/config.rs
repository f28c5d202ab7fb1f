//! Configuration system for sqlpilot.
//!
//! Supports TOML-based configuration with global defaults and per-database overrides.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SqlPilotError};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SqlPilotConfig {
    /// Global defaults applied to all databases unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-database configuration overrides (keyed by database name).
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,
}

/// Global default settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub query: QueryConfig,
    pub sql_lab: SqlLabConfig,
    pub results_backend: ResultsBackendConfig,
    pub temp_tables: TempTableConfig,
    pub metadata_cache: MetadataCacheConfig,
}

/// Chart (slice) query configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Row limit applied when a slice does not specify one (default: 2000).
    pub default_row_limit: u64,
    /// Chart query timeout in milliseconds (default: 60000).
    pub timeout_ms: u64,
}

/// SQL Lab execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SqlLabConfig {
    /// Hard cap on rows returned for SELECT statements (0 = unlimited).
    pub max_rows: u64,
    /// Wall-clock bound for synchronous runs, in seconds.
    pub sync_timeout_secs: u64,
    /// Cooperative soft limit for synchronous runs, in seconds.
    pub soft_timeout_secs: u64,
    /// Cooperative soft limit for asynchronous tasks, in seconds.
    pub async_time_limit_secs: u64,
    /// Attempts made when re-fetching a freshly inserted query row.
    pub lookup_retry_count: u32,
    /// Fixed sleep between lookup attempts, in milliseconds.
    pub lookup_backoff_ms: u64,
    /// Maximum async tasks running at once.
    pub max_concurrent_tasks: usize,
    /// Link attached to failed payloads.
    pub troubleshooting_link: Option<String>,
    /// Allow non-SELECT statements.
    pub allow_dml: bool,
    /// Schema forced onto CREATE TABLE AS targets.
    pub ctas_schema: Option<String>,
}

/// Out-of-band result storage.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResultsBackendConfig {
    pub enabled: bool,
    /// Entry TTL in seconds (default: 86400).
    pub ttl_secs: u64,
    /// Maximum stored payloads (default: 500).
    pub max_entries: usize,
}

/// Temporary tables created for CSV export.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TempTableConfig {
    pub prefix: String,
    pub schema: String,
    /// Newest temp tables kept per owner; older ones are dropped.
    pub retention: usize,
}

/// Physical table metadata cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetadataCacheConfig {
    /// Cache TTL in seconds (default: 3600).
    pub ttl_secs: u64,
    /// Maximum cached schemas (default: 1000).
    pub max_size: usize,
}

/// Per-database configuration (can override globals).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub query: Option<QueryConfig>,
    pub sql_lab: Option<SqlLabConfig>,
    /// Overrides the results TTL for this database only.
    pub cache_timeout_secs: Option<u64>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_row_limit: 2000,
            timeout_ms: 60_000,
        }
    }
}

impl Default for SqlLabConfig {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            sync_timeout_secs: 300,
            soft_timeout_secs: 290,
            async_time_limit_secs: 6 * 60 * 60,
            lookup_retry_count: 5,
            lookup_backoff_ms: 1000,
            max_concurrent_tasks: 8,
            troubleshooting_link: None,
            allow_dml: true,
            ctas_schema: None,
        }
    }
}

impl Default for ResultsBackendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 86_400,
            max_entries: 500,
        }
    }
}

impl Default for TempTableConfig {
    fn default() -> Self {
        Self {
            prefix: "sqlpilot_sqllab_".to_string(),
            schema: "sqlpilot".to_string(),
            retention: 3,
        }
    }
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_size: 1000,
        }
    }
}

impl SqlLabConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    pub fn async_time_limit(&self) -> Duration {
        Duration::from_secs(self.async_time_limit_secs)
    }

    pub fn lookup_backoff(&self) -> Duration {
        Duration::from_millis(self.lookup_backoff_ms)
    }

    /// The row cap, or `None` when unlimited.
    pub fn row_ceiling(&self) -> Option<u64> {
        (self.max_rows > 0).then_some(self.max_rows)
    }
}

impl SqlPilotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SqlPilotError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| SqlPilotError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `SQLPILOT_CONFIG` environment variable
    /// 2. `./sqlpilot.toml` (current directory)
    /// 3. `~/.config/sqlpilot/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("SQLPILOT_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from SQLPILOT_CONFIG");
                    return cfg;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring SQLPILOT_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("sqlpilot.toml") {
            tracing::info!("loaded config from ./sqlpilot.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("sqlpilot").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Get resolved config for a specific database (merges global defaults).
    pub fn for_database(&self, name: &str) -> ResolvedDatabaseConfig {
        ResolvedDatabaseConfig::merge(&self.defaults, self.databases.get(name))
    }
}

/// Fully resolved configuration for a database (no Option fields).
#[derive(Debug, Clone)]
pub struct ResolvedDatabaseConfig {
    pub query: QueryConfig,
    pub sql_lab: SqlLabConfig,
    pub results_ttl: Duration,
}

impl ResolvedDatabaseConfig {
    fn merge(defaults: &GlobalDefaults, override_cfg: Option<&DatabaseConfig>) -> Self {
        let default_ttl = defaults.results_backend.ttl_secs;
        match override_cfg {
            Some(db) => Self {
                query: db.query.clone().unwrap_or_else(|| defaults.query.clone()),
                sql_lab: db
                    .sql_lab
                    .clone()
                    .unwrap_or_else(|| defaults.sql_lab.clone()),
                results_ttl: Duration::from_secs(db.cache_timeout_secs.unwrap_or(default_ttl)),
            },
            None => Self {
                query: defaults.query.clone(),
                sql_lab: defaults.sql_lab.clone(),
                results_ttl: Duration::from_secs(default_ttl),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = SqlPilotConfig::default();
        assert_eq!(cfg.defaults.sql_lab.max_rows, 10_000);
        assert_eq!(cfg.defaults.sql_lab.lookup_retry_count, 5);
        assert_eq!(cfg.defaults.temp_tables.retention, 3);
        assert!(!cfg.defaults.results_backend.enabled);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[defaults.sql_lab]
max_rows = 500
sync_timeout_secs = 30

[defaults.results_backend]
enabled = true
ttl_secs = 600

[databases.warehouse]
cache_timeout_secs = 60
"#;
        let cfg = SqlPilotConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.defaults.sql_lab.max_rows, 500);
        assert_eq!(cfg.defaults.sql_lab.sync_timeout(), Duration::from_secs(30));
        // unspecified keys keep their defaults
        assert_eq!(cfg.defaults.sql_lab.lookup_retry_count, 5);
        assert!(cfg.defaults.results_backend.enabled);

        let resolved = cfg.for_database("warehouse");
        assert_eq!(resolved.results_ttl, Duration::from_secs(60));
        assert_eq!(cfg.for_database("other").results_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_database_override() {
        let toml = r#"
[defaults.sql_lab]
max_rows = 100

[databases.prod.sql_lab]
max_rows = 0
"#;
        let cfg = SqlPilotConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.for_database("unknown").sql_lab.row_ceiling(), Some(100));
        assert_eq!(cfg.for_database("prod").sql_lab.row_ceiling(), None);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = SqlPilotConfig::from_toml("defaults = [").unwrap_err();
        assert!(matches!(err, SqlPilotError::Config(_)));
    }
}
