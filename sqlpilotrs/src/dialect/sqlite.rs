//! SQLite dialect.

use chrono::NaiveDateTime;

use super::{DialectAdapter, TimeGrain};

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

static GRAINS: [TimeGrain; 7] = [
    TimeGrain::new(
        "second",
        Some("PT1S"),
        "DATETIME(STRFTIME('%Y-%m-%dT%H:%M:%S', {col}))",
    ),
    TimeGrain::new(
        "minute",
        Some("PT1M"),
        "DATETIME(STRFTIME('%Y-%m-%dT%H:%M:00', {col}))",
    ),
    TimeGrain::new(
        "hour",
        Some("PT1H"),
        "DATETIME(STRFTIME('%Y-%m-%dT%H:00:00', {col}))",
    ),
    TimeGrain::new("day", Some("P1D"), "DATE({col})"),
    TimeGrain::new(
        "week",
        Some("P1W"),
        "DATE({col}, -strftime('%W', {col}) || ' days')",
    ),
    TimeGrain::new(
        "month",
        Some("P1M"),
        "DATE({col}, -strftime('%d', {col}) || ' days', '+1 day')",
    ),
    TimeGrain::new(
        "year",
        Some("P1Y"),
        "DATETIME(STRFTIME('%Y-01-01T00:00:00', {col}))",
    ),
];

impl DialectAdapter for SqliteDialect {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    fn time_grains(&self) -> &'static [TimeGrain] {
        &GRAINS
    }

    fn epoch_to_dttm(&self) -> Option<&'static str> {
        Some("datetime({col}, 'unixepoch')")
    }

    fn convert_dttm(&self, _target_type: &str, dttm: &NaiveDateTime) -> Option<String> {
        Some(format!("'{}'", dttm.format("%Y-%m-%dT%H:%M:%S")))
    }

    // One schema per file; the attached database name is not a catalog filter.
    fn list_tables_sql(&self, _schema: &str, prefix: &str) -> String {
        format!(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '{}%'",
            prefix.replace('\'', "''")
        )
    }
}
