//! CSV export of query results and the temporary tables used to stage
//! exports on backends that cannot stream a result directly.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use csv::ByteRecord;
use serde_json::Value;

use crate::backends::BackendConnection;
use crate::config::TempTableConfig;
use crate::dialect::DialectAdapter;
use crate::error::{Result, SqlPilotError};
use crate::normalizer::{normalize, CellValue, ResultSet};
use crate::sql_lab::SqlLab;
use crate::sql_parse::{as_create_table, split_statements};

/// Field delimiter and header switch for CSV output.
#[derive(Debug, Clone, Copy)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub with_header: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            with_header: true,
        }
    }
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Write `results` as CSV into `out`, columns in result order.
pub fn write_csv<W: Write>(results: &ResultSet, out: W, options: CsvOptions) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(options.delimiter)
        .from_writer(out);
    let names = results.column_names();
    let mut record = ByteRecord::with_capacity(1024, names.len());

    if options.with_header {
        for name in &names {
            record.push_field(name.as_bytes());
        }
        writer.write_byte_record(&record)?;
    }
    for row in &results.data {
        record.clear();
        for name in &names {
            record.push_field(cell_text(row.get(*name)).as_bytes());
        }
        writer.write_byte_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn to_csv_bytes(results: &ResultSet, options: CsvOptions) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_csv(results, &mut buf, options)?;
    Ok(buf)
}

/// Replay a payload stored by SQL Lab as CSV.
pub async fn export_cached_results(lab: &SqlLab, key: &str, options: CsvOptions) -> Result<Vec<u8>> {
    let payload = lab.fetch_results(key).await?;
    let size = payload.data.len();
    let results = ResultSet {
        columns: payload.columns,
        data: payload.data,
        size,
    };
    to_csv_bytes(&results, options)
}

/// A staged table owned by one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempTable {
    pub name: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

/// Names, creates and drops staging tables. After each creation the backend
/// catalog is read and all but the newest `retention` tables of the owner are
/// dropped, including tables left behind by earlier processes.
pub struct TempTableManager {
    config: TempTableConfig,
    issued: Mutex<HashSet<String>>,
    by_owner: Mutex<HashMap<String, Vec<String>>>,
}

/// Lower-cased owner with anything outside `[a-z0-9]` replaced by `_`.
fn owner_slug(owner: &str) -> String {
    owner
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Timestamped base name and uniqueness counter; orders tables by creation.
fn creation_key(name: &str) -> (&str, u64) {
    match name.rsplit_once('_') {
        Some((base, n)) if n.len() < TIMESTAMP_LEN && is_digits(n) => {
            (base, n.parse().unwrap_or(0))
        }
        _ => (name, 0),
    }
}

const TIMESTAMP_LEN: usize = 14;

impl TempTableManager {
    pub fn new(config: TempTableConfig) -> Self {
        Self {
            config,
            issued: Mutex::new(HashSet::new()),
            by_owner: Mutex::new(HashMap::new()),
        }
    }

    fn lock<'a, T>(m: &'a Mutex<T>) -> Result<std::sync::MutexGuard<'a, T>> {
        m.lock()
            .map_err(|_| SqlPilotError::Execution("temp table registry poisoned".to_string()))
    }

    /// Unqualified name prefix shared by every table of `owner`.
    fn owner_prefix(&self, owner: &str) -> String {
        format!("{}{}_", self.config.prefix, owner_slug(owner)).to_lowercase()
    }

    /// Whether `table` (unqualified) is a name this manager issues for
    /// `owner`: the owner prefix, a timestamp and an optional counter.
    fn is_owned(&self, owner: &str, table: &str) -> bool {
        table
            .strip_prefix(&self.owner_prefix(owner))
            .is_some_and(|rest| match rest.split_once('_') {
                Some((stamp, counter)) => {
                    stamp.len() == TIMESTAMP_LEN && is_digits(stamp) && is_digits(counter)
                }
                None => rest.len() == TIMESTAMP_LEN && is_digits(rest),
            })
    }

    /// `<schema>.<prefix><owner>_<timestamp>`, lower-cased and unique within
    /// this manager.
    pub fn next_name(&self, owner: &str, now: DateTime<Utc>) -> Result<String> {
        let base = format!(
            "{}.{}{}",
            self.config.schema,
            self.owner_prefix(owner),
            now.format("%Y%m%d%H%M%S")
        )
        .to_lowercase();
        let mut issued = Self::lock(&self.issued)?;
        let mut name = base.clone();
        let mut n = 1;
        while issued.contains(&name) {
            name = format!("{base}_{n}");
            n += 1;
        }
        issued.insert(name.clone());
        Ok(name)
    }

    fn forget(&self, name: &str) {
        if let Ok(mut issued) = Self::lock(&self.issued) {
            issued.remove(name);
        }
    }

    /// Create the table from `select_sql`, then prune the owner's older tables.
    /// A failed create releases the reserved name.
    pub async fn materialize(
        &self,
        conn: &dyn BackendConnection,
        dialect: &dyn DialectAdapter,
        owner: &str,
        select_sql: &str,
    ) -> Result<TempTable> {
        let created_at = Utc::now();
        let name = self.next_name(owner, created_at)?;
        if let Err(e) = self.create(conn, &name, select_sql).await {
            tracing::warn!(table = %name, owner, error = %e, "failed to create temp table");
            self.forget(&name);
            return Err(e);
        }
        tracing::info!(table = %name, owner, "materialized temp table");
        Self::lock(&self.by_owner)?
            .entry(owner.to_string())
            .or_default()
            .push(name.clone());

        self.prune(conn, dialect, owner).await;
        Ok(TempTable {
            name,
            owner: owner.to_string(),
            created_at,
        })
    }

    async fn create(&self, conn: &dyn BackendConnection, name: &str, select_sql: &str) -> Result<()> {
        conn.execute_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.config.schema))
            .await?;
        for statement in split_statements(&as_create_table(name, select_sql, true)) {
            conn.execute_sql(&statement).await?;
        }
        Ok(())
    }

    /// Drop all but the newest `retention` tables of `owner`. When the catalog
    /// cannot be read only tables created by this manager are considered.
    pub async fn prune(&self, conn: &dyn BackendConnection, dialect: &dyn DialectAdapter, owner: &str) {
        let listing = dialect.list_tables_sql(&self.config.schema, &self.owner_prefix(owner));
        let mut tables: Vec<String> = match conn.execute_sql(&listing).await {
            Ok(raw) => raw
                .rows
                .into_iter()
                .filter_map(|row| match row.into_iter().next() {
                    Some(CellValue::Text(name)) => Some(name),
                    _ => None,
                })
                .filter(|name| self.is_owned(owner, name))
                .map(|name| format!("{}.{}", self.config.schema, name))
                .collect(),
            Err(e) => {
                tracing::warn!(owner, error = %e, "temp table catalog unavailable");
                Vec::new()
            }
        };
        for known in self.tables_for(owner) {
            if !tables.contains(&known) {
                tables.push(known);
            }
        }
        tables.sort_by(|a, b| creation_key(b).cmp(&creation_key(a)));

        let stale: Vec<String> = tables.into_iter().skip(self.config.retention).collect();
        if stale.is_empty() {
            return;
        }
        if let Ok(mut owners) = Self::lock(&self.by_owner) {
            if let Some(list) = owners.get_mut(owner) {
                list.retain(|t| !stale.contains(t));
            }
        }
        for table in stale {
            self.drop_table(conn, &table).await;
        }
    }

    /// Best-effort drop; failures are logged, never raised.
    pub async fn drop_table(&self, conn: &dyn BackendConnection, name: &str) {
        match conn.execute_sql(&format!("DROP TABLE IF EXISTS {name}")).await {
            Ok(_) => tracing::debug!(table = %name, "dropped temp table"),
            Err(e) => tracing::warn!(table = %name, error = %e, "failed to drop temp table"),
        }
        self.forget(name);
    }

    /// Remove a table that is no longer needed from the owner's list and drop it.
    pub async fn release(&self, conn: &dyn BackendConnection, table: &TempTable) -> Result<()> {
        {
            let mut owners = Self::lock(&self.by_owner)?;
            if let Some(tables) = owners.get_mut(&table.owner) {
                tables.retain(|t| t != &table.name);
            }
        }
        self.drop_table(conn, &table.name).await;
        Ok(())
    }

    pub fn tables_for(&self, owner: &str) -> Vec<String> {
        Self::lock(&self.by_owner)
            .map(|owners| owners.get(owner).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Stage `select_sql` in a temp table, read it back as CSV, then drop it.
    pub async fn export_via_temp_table(
        &self,
        conn: &dyn BackendConnection,
        dialect: &dyn DialectAdapter,
        owner: &str,
        select_sql: &str,
        options: CsvOptions,
    ) -> Result<Vec<u8>> {
        let table = self.materialize(conn, dialect, owner, select_sql).await?;
        let (schema, name) = match table.name.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table.name.as_str()),
        };
        let read_back = conn.execute_sql(&dialect.select_star(name, schema, None)).await;
        self.release(conn, &table).await?;
        let raw = read_back?;
        to_csv_bytes(&normalize(&raw.columns, raw.rows), options)
    }
}
