//! The declarative chart request, as sent by the front end.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Placeholder for SQL `NULL` inside `in`/`not in` value lists.
pub const NULL_SENTINEL: &str = "<NULL>";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    /// Time column.
    pub granularity: Option<String>,
    pub groupby: Vec<String>,
    pub metrics: Vec<MetricRef>,
    /// Raw projection; disables aggregation when non-empty.
    pub columns: Vec<String>,
    #[serde(deserialize_with = "deserialize_dttm")]
    pub from_dttm: Option<NaiveDateTime>,
    #[serde(deserialize_with = "deserialize_dttm")]
    pub to_dttm: Option<NaiveDateTime>,
    pub filters: Vec<Filter>,
    pub is_timeseries: bool,
    /// Top-N group count; 0 disables series limiting.
    pub timeseries_limit: u64,
    pub timeseries_limit_metric: Option<MetricRef>,
    pub row_limit: Option<u64>,
    /// Time window for the top-N subquery; defaults to the outer window.
    #[serde(deserialize_with = "deserialize_dttm")]
    pub inner_from_dttm: Option<NaiveDateTime>,
    #[serde(deserialize_with = "deserialize_dttm")]
    pub inner_to_dttm: Option<NaiveDateTime>,
    /// `[metric, ascending]` pairs.
    pub orderby: Vec<(MetricRef, bool)>,
    pub order_desc: bool,
    pub prequeries: Vec<String>,
    pub is_prequery: bool,
    pub extras: Extras,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            granularity: None,
            groupby: Vec::new(),
            metrics: Vec::new(),
            columns: Vec::new(),
            from_dttm: None,
            to_dttm: None,
            filters: Vec::new(),
            is_timeseries: false,
            timeseries_limit: 0,
            timeseries_limit_metric: None,
            row_limit: None,
            inner_from_dttm: None,
            inner_to_dttm: None,
            orderby: Vec::new(),
            order_desc: true,
            prequeries: Vec::new(),
            is_prequery: false,
            extras: Extras::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Extras {
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
    pub having: Option<String>,
    pub time_grain_sqla: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub col: Option<String>,
    pub op: Option<FilterOp>,
    #[serde(default)]
    pub val: Value,
}

impl Filter {
    pub fn new(col: impl Into<String>, op: FilterOp, val: Value) -> Self {
        Self {
            col: Some(col.into()),
            op: Some(op),
            val,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "LIKE", alias = "like")]
    Like,
    #[serde(rename = "in", alias = "IN")]
    In,
    #[serde(rename = "not in", alias = "NOT IN")]
    NotIn,
    #[serde(rename = "IS NULL")]
    IsNull,
    #[serde(rename = "IS NOT NULL")]
    IsNotNull,
}

impl FilterOp {
    pub fn is_list(self) -> bool {
        matches!(self, FilterOp::In | FilterOp::NotIn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregate {
    #[serde(rename = "SUM", alias = "sum")]
    Sum,
    #[serde(rename = "AVG", alias = "avg")]
    Avg,
    #[serde(rename = "MIN", alias = "min")]
    Min,
    #[serde(rename = "MAX", alias = "max")]
    Max,
    #[serde(rename = "COUNT", alias = "count")]
    Count,
    #[serde(rename = "COUNT_DISTINCT", alias = "count_distinct")]
    CountDistinct,
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
            Aggregate::Count => "COUNT",
            Aggregate::CountDistinct => "COUNT_DISTINCT",
        };
        f.write_str(s)
    }
}

/// A saved metric name or an inline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricRef {
    Named(String),
    Adhoc(AdhocMetric),
}

impl MetricRef {
    pub fn named(name: impl Into<String>) -> Self {
        MetricRef::Named(name.into())
    }

    /// Output column label.
    pub fn label(&self) -> String {
        match self {
            MetricRef::Named(name) => name.clone(),
            MetricRef::Adhoc(adhoc) => adhoc.label(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpressionType {
    Simple,
    Sql,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdhocMetric {
    pub expression_type: ExpressionType,
    #[serde(default)]
    pub aggregate: Option<Aggregate>,
    #[serde(default)]
    pub column: Option<AdhocColumn>,
    #[serde(default)]
    pub sql_expression: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Either `{"column_name": ...}` or a bare column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdhocColumn {
    Object { column_name: String },
    Name(String),
}

impl AdhocColumn {
    pub fn name(&self) -> &str {
        match self {
            AdhocColumn::Object { column_name } => column_name,
            AdhocColumn::Name(name) => name,
        }
    }
}

impl AdhocMetric {
    pub fn simple(agg: Aggregate, column: impl Into<String>) -> Self {
        Self {
            expression_type: ExpressionType::Simple,
            aggregate: Some(agg),
            column: Some(AdhocColumn::Name(column.into())),
            sql_expression: None,
            label: None,
        }
    }

    pub fn sql(expression: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            expression_type: ExpressionType::Sql,
            aggregate: None,
            column: None,
            sql_expression: Some(expression.into()),
            label: Some(label.into()),
        }
    }

    pub fn label(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        match self.expression_type {
            ExpressionType::Simple => {
                let column = self.column.as_ref().map(AdhocColumn::name).unwrap_or("");
                match self.aggregate {
                    Some(agg) => format!("{agg}({column})"),
                    None => column.to_string(),
                }
            }
            ExpressionType::Sql => self.sql_expression.clone().unwrap_or_default(),
        }
    }
}

/// Accepts epoch seconds, epoch milliseconds, or ISO-8601 text.
fn deserialize_dttm<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let raw = n
                .as_f64()
                .ok_or_else(|| de::Error::custom("invalid epoch value"))?;
            // Values past year 5138 in seconds are treated as milliseconds.
            let millis = if raw.abs() > 1e11 { raw } else { raw * 1000.0 };
            DateTime::from_timestamp_millis(millis as i64)
                .map(|dt| Some(dt.naive_utc()))
                .ok_or_else(|| de::Error::custom(format!("epoch out of range: {raw}")))
        }
        Some(Value::String(s)) => parse_dttm(&s)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("unrecognised datetime: {s}"))),
        Some(other) => Err(de::Error::custom(format!("unsupported datetime value: {other}"))),
    }
}

pub fn parse_dttm(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_shape() {
        let spec: QuerySpec = serde_json::from_value(json!({
            "granularity": "ds",
            "groupby": ["region"],
            "metrics": [
                "count",
                {"expressionType": "SIMPLE", "aggregate": "SUM", "column": {"column_name": "amount"}},
                {"expressionType": "SQL", "sqlExpression": "MAX(x)", "label": "top"}
            ],
            "filters": [{"col": "status", "op": "not in", "val": ["a", "<NULL>"]}],
            "from_dttm": "2020-01-01",
            "to_dttm": 1577923200,
            "extras": {"where": "1 = 1", "time_grain_sqla": "P1D"},
            "orderby": [["count", false]]
        }))
        .unwrap();

        assert!(spec.order_desc);
        assert_eq!(spec.metrics[0], MetricRef::named("count"));
        assert_eq!(spec.metrics[1].label(), "SUM(amount)");
        assert_eq!(spec.metrics[2].label(), "top");
        assert_eq!(spec.filters[0].op, Some(FilterOp::NotIn));
        assert_eq!(spec.extras.where_clause.as_deref(), Some("1 = 1"));
        assert_eq!(
            spec.from_dttm.unwrap().to_string(),
            "2020-01-01 00:00:00"
        );
        assert_eq!(spec.to_dttm.unwrap().to_string(), "2020-01-02 00:00:00");
        assert_eq!(spec.orderby[0], (MetricRef::named("count"), false));
    }

    #[test]
    fn epoch_millis_are_detected() {
        let spec: QuerySpec = serde_json::from_value(json!({"from_dttm": 1577836800000i64})).unwrap();
        assert_eq!(spec.from_dttm.unwrap().to_string(), "2020-01-01 00:00:00");
    }

    #[test]
    fn missing_col_or_op_still_parses() {
        let spec: QuerySpec =
            serde_json::from_value(json!({"filters": [{"val": "x"}]})).unwrap();
        assert!(spec.filters[0].col.is_none());
        assert!(spec.filters[0].op.is_none());
    }
}
