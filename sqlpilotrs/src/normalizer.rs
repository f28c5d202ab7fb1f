//! Turns driver rows into the canonical, JSON-safe result payload.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Column as described by the driver cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    pub type_hint: Option<String>,
}

impl RawColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: None,
        }
    }

    pub fn typed(name: impl Into<String>, type_hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: Some(type_hint.into()),
        }
    }
}

/// A single driver cell, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision decimal, in its textual form.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    List(Vec<CellValue>),
    Map(Vec<(String, CellValue)>),
}

/// Cursor output: description plus rows in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RawResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: String,
    pub is_date: bool,
    pub is_dim: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<ColumnInfo>,
    pub data: Vec<Map<String, Value>>,
    pub size: usize,
}

impl ResultSet {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Suffix repeated names with `__1`, `__2`, ... in first-seen order.
pub fn dedup_column_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut taken: std::collections::HashSet<String> =
        names.iter().map(|n| n.as_ref().to_string()).collect();
    let mut out = Vec::with_capacity(names.len());
    let mut emitted: std::collections::HashSet<String> = std::collections::HashSet::new();
    for name in names {
        let name = name.as_ref();
        if emitted.insert(name.to_string()) {
            counts.insert(name.to_string(), 0);
            out.push(name.to_string());
            continue;
        }
        let count = counts.entry(name.to_string()).or_insert(0);
        let candidate = loop {
            *count += 1;
            let candidate = format!("{name}__{count}");
            if !taken.contains(&candidate) {
                break candidate;
            }
        };
        taken.insert(candidate.clone());
        emitted.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

pub fn normalize(description: &[RawColumn], rows: Vec<Vec<CellValue>>) -> ResultSet {
    let raw_names: Vec<&str> = description.iter().map(|c| c.name.as_str()).collect();
    let names = dedup_column_names(&raw_names[..]);

    let mut inferred: Vec<Option<&'static str>> = vec![None; description.len()];
    let mut data = Vec::with_capacity(rows.len());
    for row in rows {
        let mut record = Map::new();
        for (idx, cell) in row.into_iter().enumerate() {
            let Some(name) = names.get(idx) else {
                tracing::warn!(idx, "row wider than cursor description, extra cell dropped");
                continue;
            };
            if inferred[idx].is_none() {
                inferred[idx] = logical_type(&cell);
            }
            record.insert(name.clone(), coerce(cell));
        }
        data.push(record);
    }

    let columns = description
        .iter()
        .zip(names)
        .zip(inferred)
        .map(|((raw, name), ty)| {
            let logical_type = match ty {
                Some(ty) => ty.to_string(),
                None => raw
                    .type_hint
                    .as_deref()
                    .map(hint_type)
                    .unwrap_or("STRING")
                    .to_string(),
            };
            let is_date = matches!(logical_type.as_str(), "DATETIME" | "DATE");
            let is_dim = matches!(logical_type.as_str(), "STRING" | "BOOL");
            ColumnInfo {
                name,
                logical_type,
                is_date,
                is_dim,
            }
        })
        .collect();

    let size = data.len();
    ResultSet {
        columns,
        data,
        size,
    }
}

fn logical_type(cell: &CellValue) -> Option<&'static str> {
    Some(match cell {
        CellValue::Null => return None,
        CellValue::Bool(_) => "BOOL",
        CellValue::Int(_) => "INT",
        CellValue::Float(_) => "FLOAT",
        CellValue::Decimal(_) => "DECIMAL",
        CellValue::Text(_) => "STRING",
        CellValue::Bytes(_) => "BYTES",
        CellValue::Date(_) => "DATE",
        CellValue::Time(_) => "TIME",
        CellValue::Timestamp(_) | CellValue::TimestampTz(_) => "DATETIME",
        CellValue::List(_) | CellValue::Map(_) => "JSON",
    })
}

fn hint_type(hint: &str) -> &'static str {
    let upper = hint.to_ascii_uppercase();
    if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
        "DATETIME"
    } else if upper.contains("DATE") {
        "DATE"
    } else if upper.contains("INT") {
        "INT"
    } else if ["FLOAT", "DOUBLE", "REAL"].iter().any(|t| upper.contains(t)) {
        "FLOAT"
    } else if ["DECIMAL", "NUMERIC"].iter().any(|t| upper.contains(t)) {
        "DECIMAL"
    } else if upper.contains("BOOL") {
        "BOOL"
    } else {
        "STRING"
    }
}

/// Significant digits an f64 round-trips exactly.
const DECIMAL_SAFE_DIGITS: usize = 15;

fn coerce(cell: CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Bool(b) => Value::Bool(b),
        CellValue::Int(i) => Value::from(i),
        CellValue::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        CellValue::Decimal(text) => {
            let digits = text.chars().filter(char::is_ascii_digit).count();
            match text.parse::<f64>().ok().and_then(Number::from_f64) {
                Some(n) if digits <= DECIMAL_SAFE_DIGITS => Value::Number(n),
                _ => Value::String(text),
            }
        }
        CellValue::Text(s) => Value::String(s),
        CellValue::Bytes(bytes) => Value::String(hex::encode(bytes)),
        CellValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        CellValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
        CellValue::Timestamp(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        CellValue::TimestampTz(ts) => Value::String(ts.to_rfc3339()),
        nested @ (CellValue::List(_) | CellValue::Map(_)) => {
            Value::String(nested_json(nested).to_string())
        }
    }
}

/// Nested values keep their structure inside the serialized text.
fn nested_json(cell: CellValue) -> Value {
    match cell {
        CellValue::List(items) => Value::Array(items.into_iter().map(nested_json).collect()),
        CellValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, nested_json(v)))
                .collect(),
        ),
        other => coerce(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedups_in_first_seen_order() {
        assert_eq!(dedup_column_names(&["a", "a", "a"]), vec!["a", "a__1", "a__2"]);
        assert_eq!(
            dedup_column_names(&["a", "b", "a", "b"]),
            vec!["a", "b", "a__1", "b__1"]
        );
    }

    #[test]
    fn dedup_avoids_existing_suffixes() {
        assert_eq!(
            dedup_column_names(&["a", "a__1", "a"]),
            vec!["a", "a__1", "a__2"]
        );
    }

    #[test]
    fn coerces_non_primitive_cells() {
        let ts = NaiveDate::from_ymd_opt(2021, 5, 4)
            .unwrap()
            .and_hms_opt(1, 2, 3)
            .unwrap();
        let rs = normalize(
            &[
                RawColumn::new("bytes"),
                RawColumn::new("ts"),
                RawColumn::new("nested"),
                RawColumn::new("nan"),
                RawColumn::new("big"),
                RawColumn::new("small"),
            ],
            vec![vec![
                CellValue::Bytes(vec![0xde, 0xad]),
                CellValue::Timestamp(ts),
                CellValue::List(vec![CellValue::Int(1), CellValue::Text("x".into())]),
                CellValue::Float(f64::NAN),
                CellValue::Decimal("12345678901234567890.5".into()),
                CellValue::Decimal("10.25".into()),
            ]],
        );
        let row = &rs.data[0];
        assert_eq!(row["bytes"], json!("dead"));
        assert_eq!(row["ts"], json!("2021-05-04T01:02:03"));
        assert_eq!(row["nested"], json!("[1,\"x\"]"));
        assert_eq!(row["nan"], Value::Null);
        assert_eq!(row["big"], json!("12345678901234567890.5"));
        assert_eq!(row["small"], json!(10.25));
        assert_eq!(rs.size, 1);
    }

    #[test]
    fn infers_types_from_first_non_null() {
        let rs = normalize(
            &[
                RawColumn::typed("d", "DATE"),
                RawColumn::new("name"),
                RawColumn::new("n"),
            ],
            vec![
                vec![CellValue::Null, CellValue::Null, CellValue::Null],
                vec![
                    CellValue::Null,
                    CellValue::Text("x".into()),
                    CellValue::Int(3),
                ],
            ],
        );
        let types: Vec<(&str, bool, bool)> = rs
            .columns
            .iter()
            .map(|c| (c.logical_type.as_str(), c.is_date, c.is_dim))
            .collect();
        assert_eq!(
            types,
            vec![("DATE", true, false), ("STRING", false, true), ("INT", false, false)]
        );
    }

    #[test]
    fn duplicate_columns_keep_all_values() {
        let rs = normalize(
            &[RawColumn::new("a"), RawColumn::new("a")],
            vec![vec![CellValue::Int(1), CellValue::Int(2)]],
        );
        assert_eq!(rs.column_names(), vec!["a", "a__1"]);
        assert_eq!(rs.data[0]["a__1"], json!(2));
    }
}
