//! PostgreSQL dialect.

use chrono::NaiveDateTime;

use super::{DialectAdapter, TimeGrain};

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

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

impl DialectAdapter for PostgresDialect {
    fn engine(&self) -> &'static str {
        "postgresql"
    }

    fn time_grains(&self) -> &'static [TimeGrain] {
        &GRAINS
    }

    fn epoch_to_dttm(&self) -> Option<&'static str> {
        Some("(timestamp 'epoch' + {col} * interval '1 second')")
    }

    fn convert_dttm(&self, _target_type: &str, dttm: &NaiveDateTime) -> Option<String> {
        Some(format!("'{}'", dttm.format("%Y-%m-%d %H:%M:%S")))
    }

    /// Driver errors arrive as `db error: ERROR: <message>\nDETAIL: ...`.
    fn extract_error_message(&self, raw: &str) -> String {
        let mut msg = raw.trim();
        for prefix in ["db error:", "ERROR:"] {
            if let Some(rest) = msg.strip_prefix(prefix) {
                msg = rest.trim_start();
            }
        }
        msg.lines().next().unwrap_or(msg).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_driver_prefixes() {
        let msg = PostgresDialect.extract_error_message(
            "db error: ERROR: relation \"foo\" does not exist\nLINE 1: select * from foo",
        );
        assert_eq!(msg, "relation \"foo\" does not exist");
    }

    #[test]
    fn epoch_ms_divides_first() {
        assert_eq!(
            PostgresDialect.epoch_ms_to_dttm().unwrap(),
            "(timestamp 'epoch' + ({col}/1000) * interval '1 second')"
        );
    }
}
