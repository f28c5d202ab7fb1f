//! MySQL dialect.

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{DialectAdapter, TimeGrain};

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

static GRAINS: [TimeGrain; 8] = [
    TimeGrain::new(
        "second",
        Some("PT1S"),
        "DATE_ADD(DATE({col}), INTERVAL (HOUR({col})*60*60 + MINUTE({col})*60 + SECOND({col})) SECOND)",
    ),
    TimeGrain::new(
        "minute",
        Some("PT1M"),
        "DATE_ADD(DATE({col}), INTERVAL (HOUR({col})*60 + MINUTE({col})) MINUTE)",
    ),
    TimeGrain::new(
        "hour",
        Some("PT1H"),
        "DATE_ADD(DATE({col}), INTERVAL HOUR({col}) HOUR)",
    ),
    TimeGrain::new("day", Some("P1D"), "DATE({col})"),
    TimeGrain::new(
        "week",
        Some("P1W"),
        "DATE(DATE_SUB({col}, INTERVAL DAYOFWEEK({col}) - 1 DAY))",
    ),
    TimeGrain::new(
        "month",
        Some("P1M"),
        "DATE(DATE_SUB({col}, INTERVAL DAYOFMONTH({col}) - 1 DAY))",
    ),
    TimeGrain::new(
        "quarter",
        Some("P0.25Y"),
        "MAKEDATE(YEAR({col}), 1) + INTERVAL QUARTER({col}) QUARTER - INTERVAL 1 QUARTER",
    ),
    TimeGrain::new(
        "year",
        Some("P1Y"),
        "DATE(DATE_SUB({col}, INTERVAL DAYOFYEAR({col}) - 1 DAY))",
    ),
];

/// `(1146, "Table 'x.y' doesn't exist")`
static DRIVER_TUPLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\(?\s*\d+\s*,\s*["'](?s)(.*)["']\s*\)?$"#).expect("static regex")
});

impl DialectAdapter for MySqlDialect {
    fn engine(&self) -> &'static str {
        "mysql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn time_grains(&self) -> &'static [TimeGrain] {
        &GRAINS
    }

    fn epoch_to_dttm(&self) -> Option<&'static str> {
        Some("from_unixtime({col})")
    }

    fn convert_dttm(&self, target_type: &str, dttm: &NaiveDateTime) -> Option<String> {
        let upper = target_type.to_ascii_uppercase();
        if upper == "DATETIME" || upper == "DATE" {
            Some(format!(
                "STR_TO_DATE('{}', '%Y-%m-%d %H:%i:%s')",
                dttm.format("%Y-%m-%d %H:%M:%S")
            ))
        } else {
            None
        }
    }

    fn extract_error_message(&self, raw: &str) -> String {
        let msg = raw.trim();
        match DRIVER_TUPLE.captures(msg).and_then(|c| c.get(1)) {
            Some(inner) => inner.as_str().to_string(),
            None => msg.to_string(),
        }
    }
}
