//! Hive dialect, also registered for Inceptor.

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{DialectAdapter, TimeGrain};

#[derive(Debug, Default, Clone, Copy)]
pub struct HiveDialect;

static GRAINS: [TimeGrain; 7] = [
    TimeGrain::new(
        "second",
        Some("PT1S"),
        "from_unixtime(unix_timestamp({col}), 'yyyy-MM-dd HH:mm:ss')",
    ),
    TimeGrain::new(
        "minute",
        Some("PT1M"),
        "from_unixtime(unix_timestamp({col}), 'yyyy-MM-dd HH:mm:00')",
    ),
    TimeGrain::new(
        "hour",
        Some("PT1H"),
        "from_unixtime(unix_timestamp({col}), 'yyyy-MM-dd HH:00:00')",
    ),
    TimeGrain::new(
        "day",
        Some("P1D"),
        "from_unixtime(unix_timestamp({col}), 'yyyy-MM-dd 00:00:00')",
    ),
    TimeGrain::new(
        "week",
        Some("P1W"),
        "date_format(date_sub({col}, CAST(7-from_unixtime(unix_timestamp({col}),'u') as int)), 'yyyy-MM-dd 00:00:00')",
    ),
    TimeGrain::new(
        "month",
        Some("P1M"),
        "from_unixtime(unix_timestamp({col}), 'yyyy-MM-01 00:00:00')",
    ),
    TimeGrain::new(
        "year",
        Some("P1Y"),
        "from_unixtime(unix_timestamp({col}), 'yyyy-01-01 00:00:00')",
    ),
];

static ERROR_MESSAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"errorMessage="(.*?)""#).expect("static regex"));

impl DialectAdapter for HiveDialect {
    fn engine(&self) -> &'static str {
        "hive"
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
        match target_type.to_ascii_uppercase().as_str() {
            "DATE" => Some(format!("CAST('{}' AS DATE)", dttm.format("%Y-%m-%d"))),
            "TIMESTAMP" => Some(format!(
                "CAST('{}' AS TIMESTAMP)",
                dttm.format("%Y-%m-%d %H:%M:%S")
            )),
            _ => None,
        }
    }

    fn extract_error_message(&self, raw: &str) -> String {
        match ERROR_MESSAGE.captures(raw).and_then(|c| c.get(1)) {
            Some(m) => m.as_str().to_string(),
            None => raw.trim().to_string(),
        }
    }

    fn supports_inner_joins(&self) -> bool {
        false
    }

    fn list_tables_sql(&self, schema: &str, prefix: &str) -> String {
        format!(
            "SHOW TABLES IN {} LIKE '{}*'",
            self.quote_ident(schema),
            prefix.replace('\'', "")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulls_error_message_field() {
        let raw = r#"TExecuteStatementResp(status=TStatus(errorCode=40000, errorMessage="Error while compiling statement: FAILED"), x=1)"#;
        assert_eq!(
            HiveDialect.extract_error_message(raw),
            "Error while compiling statement: FAILED"
        );
    }

    #[test]
    fn no_inner_joins() {
        assert!(!HiveDialect.supports_inner_joins());
    }
}
