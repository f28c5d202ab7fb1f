//! DuckDB dialect.

use chrono::NaiveDateTime;

use super::{DialectAdapter, TimeGrain};

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDialect;

static GRAINS: [TimeGrain; 8] = [
    TimeGrain::new("second", Some("PT1S"), "DATE_TRUNC('second', {col})"),
    TimeGrain::new("minute", Some("PT1M"), "DATE_TRUNC('minute', {col})"),
    TimeGrain::new("hour", Some("PT1H"), "DATE_TRUNC('hour', {col})"),
    TimeGrain::new("day", Some("P1D"), "DATE_TRUNC('day', {col})"),
    TimeGrain::new("week", Some("P1W"), "DATE_TRUNC('week', {col})"),
    TimeGrain::new("month", Some("P1M"), "DATE_TRUNC('month', {col})"),
    TimeGrain::new("quarter", Some("P0.25Y"), "DATE_TRUNC('quarter', {col})"),
    TimeGrain::new("year", Some("P1Y"), "DATE_TRUNC('year', {col})"),
];

impl DialectAdapter for DuckDbDialect {
    fn engine(&self) -> &'static str {
        "duckdb"
    }

    fn time_grains(&self) -> &'static [TimeGrain] {
        &GRAINS
    }

    fn epoch_to_dttm(&self) -> Option<&'static str> {
        Some("TO_TIMESTAMP({col})")
    }

    fn epoch_ms_to_dttm(&self) -> Option<String> {
        Some("EPOCH_MS({col})".to_string())
    }

    fn convert_dttm(&self, target_type: &str, dttm: &NaiveDateTime) -> Option<String> {
        let upper = target_type.to_ascii_uppercase();
        if upper == "DATE" {
            Some(format!("DATE '{}'", dttm.format("%Y-%m-%d")))
        } else {
            Some(format!("TIMESTAMP '{}'", dttm.format("%Y-%m-%d %H:%M:%S")))
        }
    }

    fn extract_error_message(&self, raw: &str) -> String {
        let msg = raw.trim();
        // "Binder Error: Referenced column ..." keeps its category prefix
        msg.strip_prefix("duckdb error:")
            .map(str::trim_start)
            .unwrap_or(msg)
            .to_string()
    }
}
