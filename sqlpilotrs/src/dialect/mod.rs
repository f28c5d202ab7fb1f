//! Backend dialect adapters.
//!
//! Each dialect lives in its own file. A [`DialectRegistry`] maps the backend
//! identifier of a connection (`postgresql`, `mysql`, ...) to its adapter and
//! falls back to [`GenericDialect`] for anything it does not know, so that
//! compilation loses features instead of failing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::query_spec::Aggregate;
use crate::sql_parse::strip_comments;

mod duckdb;
mod generic;
mod hive;
mod mysql;
mod postgres;
mod sqlite;

pub use duckdb::DuckDbDialect;
pub use generic::GenericDialect;
pub use hive::HiveDialect;
pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

/// A named truncation granularity. `function` holds a `{col}` placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeGrain {
    pub name: &'static str,
    pub duration: Option<&'static str>,
    pub function: &'static str,
}

impl TimeGrain {
    pub const fn new(name: &'static str, duration: Option<&'static str>, function: &'static str) -> Self {
        Self {
            name,
            duration,
            function,
        }
    }

    pub fn apply(&self, col: &str) -> String {
        self.function.replace("{col}", col)
    }
}

/// How a row cap is imposed on an arbitrary statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitMethod {
    /// Rewrite or append a trailing `LIMIT` clause.
    ForceLimit,
    /// Wrap the statement in `SELECT * FROM (...) AS inner_qry LIMIT n`.
    WrapSql,
}

/// Per-backend knowledge consumed by the compiler and the SQL Lab pipeline.
pub trait DialectAdapter: Send + Sync {
    /// Backend identifier this adapter was registered under.
    fn engine(&self) -> &'static str;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn time_grains(&self) -> &'static [TimeGrain] {
        &[]
    }

    /// Look a grain up by name or by ISO duration.
    fn time_grain(&self, key: &str) -> Option<&'static TimeGrain> {
        self.time_grains()
            .iter()
            .find(|g| g.name.eq_ignore_ascii_case(key) || g.duration == Some(key))
    }

    /// Epoch-seconds to timestamp, as a `{col}` format string.
    fn epoch_to_dttm(&self) -> Option<&'static str> {
        None
    }

    /// Epoch-milliseconds to timestamp, as a `{col}` format string.
    fn epoch_ms_to_dttm(&self) -> Option<String> {
        self.epoch_to_dttm()
            .map(|f| f.replace("{col}", "({col}/1000)"))
    }

    /// Backend-native datetime literal for a column of `target_type`.
    fn convert_dttm(&self, _target_type: &str, _dttm: &NaiveDateTime) -> Option<String> {
        None
    }

    fn limit_method(&self) -> LimitMethod {
        LimitMethod::ForceLimit
    }

    /// Impose a row cap on `sql`; a smaller existing limit is kept, and the
    /// result is stable under re-application.
    fn apply_limit(&self, sql: &str, limit: u64) -> String {
        apply_limit_with(self.limit_method(), sql, limit)
    }

    /// Human-readable message from a driver error string.
    fn extract_error_message(&self, raw: &str) -> String {
        raw.trim().to_string()
    }

    /// Whether top-N groups can be restricted through an inner-join subquery.
    fn supports_inner_joins(&self) -> bool {
        true
    }

    /// Backends that group time slots without a join never need top-N restriction.
    fn time_groupby_inline(&self) -> bool {
        false
    }

    fn render_aggregation(&self, agg: Aggregate, expr: &str) -> String {
        match agg {
            Aggregate::Sum => format!("SUM({expr})"),
            Aggregate::Avg => format!("AVG({expr})"),
            Aggregate::Min => format!("MIN({expr})"),
            Aggregate::Max => format!("MAX({expr})"),
            Aggregate::Count => format!("COUNT({expr})"),
            Aggregate::CountDistinct => format!("COUNT(DISTINCT {expr})"),
        }
    }

    fn render_literal(&self, value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            serde_json::Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            serde_json::Value::Object(_) => {
                format!("'{}'", value.to_string().replace('\'', "''"))
            }
        }
    }

    /// Qualified table reference, `schema.table` when a schema is given.
    fn qualify_table(&self, table: &str, schema: Option<&str>) -> String {
        match schema {
            Some(schema) => format!("{}.{}", self.quote_ident(schema), self.quote_ident(table)),
            None => self.quote_ident(table),
        }
    }

    fn select_star(&self, table: &str, schema: Option<&str>, limit: Option<u64>) -> String {
        let sql = format!("SELECT * FROM {}", self.qualify_table(table, schema));
        match limit {
            Some(limit) => self.apply_limit(&sql, limit),
            None => sql,
        }
    }

    /// Catalog query for the tables in `schema` whose name starts with
    /// `prefix`. The table name is the first column of each row.
    fn list_tables_sql(&self, schema: &str, prefix: &str) -> String {
        format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = {} AND table_name LIKE {}",
            self.render_literal(&serde_json::Value::String(schema.to_string())),
            self.render_literal(&serde_json::Value::String(format!("{prefix}%")))
        )
    }
}

impl fmt::Debug for dyn DialectAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialectAdapter")
            .field("engine", &self.engine())
            .finish()
    }
}

static TRAILING_LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\blimit\s+(?:(\d+)\s*,\s*)?(\d+)(?:\s+offset\s+\d+)?\s*$")
        .expect("static regex")
});

static TRAILING_OFFSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\boffset\s+\d+\s*$").expect("static regex"));

/// Strip whitespace and trailing semicolons.
pub(crate) fn strip_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

/// The statement as the backend sees it: comments removed, no trailing `;`.
fn limit_target(sql: &str) -> String {
    strip_statement(&strip_comments(sql)).to_string()
}

/// The row count of a trailing `LIMIT` clause, if the statement ends with one.
/// A following `OFFSET` is allowed; comments never count.
pub fn trailing_limit(sql: &str) -> Option<u64> {
    TRAILING_LIMIT
        .captures(&limit_target(sql))
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

pub(crate) fn apply_limit_with(method: LimitMethod, sql: &str, limit: u64) -> String {
    let sql = limit_target(sql);
    if let Some(caps) = TRAILING_LIMIT.captures(&sql) {
        if let Some(count) = caps.get(2) {
            match count.as_str().parse::<u64>() {
                Ok(existing) if existing <= limit => return sql.clone(),
                _ => {
                    return format!("{}{}{}", &sql[..count.start()], limit, &sql[count.end()..]);
                }
            }
        }
    }
    if TRAILING_OFFSET.is_match(&sql) {
        return format!("SELECT * FROM (\n{sql}\n) AS inner_qry LIMIT {limit}");
    }
    match method {
        LimitMethod::ForceLimit => format!("{sql}\nLIMIT {limit}"),
        LimitMethod::WrapSql => format!("SELECT * FROM (\n{sql}\n) AS inner_qry LIMIT {limit}"),
    }
}

/// Maps a backend identifier to its adapter.
#[derive(Clone)]
pub struct DialectRegistry {
    adapters: HashMap<String, Arc<dyn DialectAdapter>>,
    fallback: Arc<dyn DialectAdapter>,
}

impl Default for DialectRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("postgresql", Arc::new(PostgresDialect));
        registry.register("postgres", Arc::new(PostgresDialect));
        registry.register("mysql", Arc::new(MySqlDialect));
        registry.register("duckdb", Arc::new(DuckDbDialect));
        registry.register("sqlite", Arc::new(SqliteDialect));
        registry.register("hive", Arc::new(HiveDialect));
        registry.register("inceptor", Arc::new(HiveDialect));
        registry
    }
}

impl DialectRegistry {
    /// Registry with no adapters; every lookup yields the generic fallback.
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
            fallback: Arc::new(GenericDialect),
        }
    }

    pub fn register(&mut self, engine: impl Into<String>, adapter: Arc<dyn DialectAdapter>) {
        self.adapters.insert(engine.into().to_ascii_lowercase(), adapter);
    }

    pub fn get(&self, engine: &str) -> Arc<dyn DialectAdapter> {
        match self.adapters.get(&engine.to_ascii_lowercase()) {
            Some(adapter) => adapter.clone(),
            None => {
                tracing::debug!(engine, "no dialect registered, using generic adapter");
                self.fallback.clone()
            }
        }
    }

    pub fn contains(&self, engine: &str) -> bool {
        self.adapters.contains_key(&engine.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_limit_when_missing() {
        let sql = apply_limit_with(LimitMethod::ForceLimit, "SELECT * FROM t;", 100);
        assert_eq!(sql, "SELECT * FROM t\nLIMIT 100");
    }

    #[test]
    fn keeps_smaller_existing_limit() {
        let sql = apply_limit_with(LimitMethod::ForceLimit, "SELECT * FROM t LIMIT 10", 100);
        assert_eq!(sql, "SELECT * FROM t LIMIT 10");
    }

    #[test]
    fn lowers_larger_existing_limit() {
        let sql = apply_limit_with(LimitMethod::ForceLimit, "select * from t limit 5000", 100);
        assert_eq!(sql, "select * from t limit 100");
        let sql = apply_limit_with(LimitMethod::ForceLimit, "select * from t limit 20, 5000", 100);
        assert_eq!(sql, "select * from t limit 20, 100");
    }

    #[test]
    fn limit_application_is_idempotent() {
        for method in [LimitMethod::ForceLimit, LimitMethod::WrapSql] {
            let once = apply_limit_with(method, "SELECT a FROM t ORDER BY a", 50);
            let twice = apply_limit_with(method, &once, 50);
            assert_eq!(once, twice);
            assert_eq!(trailing_limit(&twice), Some(50));
        }
    }

    #[test]
    fn wraps_sql_for_wrap_method() {
        let sql = apply_limit_with(LimitMethod::WrapSql, "SELECT a FROM t", 7);
        assert_eq!(sql, "SELECT * FROM (\nSELECT a FROM t\n) AS inner_qry LIMIT 7");
    }

    #[test]
    fn rewrites_limit_before_offset_in_place() {
        let sql = apply_limit_with(
            LimitMethod::ForceLimit,
            "SELECT * FROM big LIMIT 50000 OFFSET 10",
            10000,
        );
        assert_eq!(sql, "SELECT * FROM big LIMIT 10000 OFFSET 10");
        assert_eq!(trailing_limit(&sql), Some(10000));

        let kept = apply_limit_with(LimitMethod::ForceLimit, "SELECT * FROM big LIMIT 5 OFFSET 10", 100);
        assert_eq!(kept, "SELECT * FROM big LIMIT 5 OFFSET 10");
    }

    #[test]
    fn bare_offset_is_wrapped() {
        let sql = apply_limit_with(LimitMethod::ForceLimit, "SELECT * FROM big OFFSET 10", 100);
        assert_eq!(sql, "SELECT * FROM (\nSELECT * FROM big OFFSET 10\n) AS inner_qry LIMIT 100");
    }

    #[test]
    fn limits_in_comments_are_ignored() {
        assert_eq!(trailing_limit("SELECT * FROM big -- limit 1"), None);
        assert_eq!(trailing_limit("SELECT * FROM big /* LIMIT 1 */"), None);
        assert_eq!(trailing_limit("SELECT * FROM big LIMIT 3 -- note"), Some(3));

        let sql = apply_limit_with(LimitMethod::ForceLimit, "SELECT * FROM big -- limit 1", 100);
        assert_eq!(sql, "SELECT * FROM big\nLIMIT 100");
    }

    #[test]
    fn limit_inside_subquery_is_not_trailing() {
        assert_eq!(trailing_limit("SELECT * FROM (SELECT a FROM t LIMIT 3) x"), None);
    }

    #[test]
    fn catalog_listing_filters_by_prefix() {
        assert_eq!(
            PostgresDialect.list_tables_sql("scratch", "tmp_ana_"),
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'scratch' AND table_name LIKE 'tmp_ana_%'"
        );
        assert_eq!(
            HiveDialect.list_tables_sql("work", "tmp_ana_"),
            "SHOW TABLES IN `work` LIKE 'tmp_ana_*'"
        );
    }

    #[test]
    fn unknown_engine_falls_back_to_generic() {
        let registry = DialectRegistry::default();
        assert_eq!(registry.get("oracle").engine(), "generic");
        assert_eq!(registry.get("PostgreSQL").engine(), "postgresql");
        assert!(!registry.contains("oracle"));
    }

    #[test]
    fn grains_resolve_by_name_or_duration() {
        let pg = PostgresDialect;
        let by_name = pg.time_grain("day").unwrap();
        let by_duration = pg.time_grain("P1D").unwrap();
        assert_eq!(by_name, by_duration);
        assert_eq!(by_name.apply("ts"), "DATE_TRUNC('day', ts)");
        assert!(GenericDialect.time_grain("day").is_none());
    }
}
