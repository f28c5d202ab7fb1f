use serde_json::Value;

use crate::models::Dataset;
use crate::query_spec::{Filter, FilterOp, NULL_SENTINEL};
use crate::sql_ast::{SqlBinaryOperator, SqlExpr};

use super::resolve::column_expr;

const EMPTY_STRING_SENTINEL: &str = "<empty string>";

/// WHERE predicates for the request filters, in request order. Filters missing
/// a column or operator, or naming an unknown column, are skipped.
pub(crate) fn build_filters(dataset: &Dataset, filters: &[Filter]) -> Vec<SqlExpr> {
    let mut out = Vec::new();
    for filter in filters {
        let (Some(col_name), Some(op)) = (filter.col.as_deref(), filter.op) else {
            continue;
        };
        if col_name.is_empty() {
            continue;
        }
        let Some(col) = dataset.column(col_name) else {
            tracing::debug!(column = col_name, "filter on unknown column skipped");
            continue;
        };
        out.push(render_filter_expr(
            column_expr(col),
            op,
            &filter.val,
            col.is_numeric(),
        ));
    }
    out
}

pub(crate) fn render_filter_expr(
    base_expr: SqlExpr,
    op: FilterOp,
    val: &Value,
    is_numeric: bool,
) -> SqlExpr {
    match op {
        FilterOp::In | FilterOp::NotIn => {
            let values = list_values(val, is_numeric);
            let has_null = values.iter().any(|v| v.is_null());
            let list: Vec<SqlExpr> = values
                .into_iter()
                .filter(|v| !v.is_null())
                .map(SqlExpr::Literal)
                .collect();
            let mut cond = if list.is_empty() {
                None
            } else {
                Some(SqlExpr::InList {
                    expr: Box::new(base_expr.clone()),
                    list,
                    negated: false,
                })
            };
            if has_null {
                let is_null = SqlExpr::IsNull {
                    expr: Box::new(base_expr),
                    negated: false,
                };
                cond = Some(match cond {
                    Some(in_list) => SqlExpr::Or(vec![in_list, is_null]),
                    None => is_null,
                });
            }
            // An empty list matches nothing.
            let cond = cond.unwrap_or_else(|| SqlExpr::raw("1 = 0"));
            if op == FilterOp::NotIn {
                SqlExpr::Not(Box::new(cond))
            } else {
                cond
            }
        }
        FilterOp::IsNull => SqlExpr::IsNull {
            expr: Box::new(base_expr),
            negated: false,
        },
        FilterOp::IsNotNull => SqlExpr::IsNull {
            expr: Box::new(base_expr),
            negated: true,
        },
        _ => {
            let value = scalar_value(val, is_numeric);
            if value.is_null() {
                match op {
                    FilterOp::Eq => {
                        return SqlExpr::IsNull {
                            expr: Box::new(base_expr),
                            negated: false,
                        }
                    }
                    FilterOp::Neq => {
                        return SqlExpr::IsNull {
                            expr: Box::new(base_expr),
                            negated: true,
                        }
                    }
                    _ => {}
                }
            }
            let op = match op {
                FilterOp::Eq => SqlBinaryOperator::Eq,
                FilterOp::Neq => SqlBinaryOperator::Neq,
                FilterOp::Gt => SqlBinaryOperator::Gt,
                FilterOp::Gte => SqlBinaryOperator::Gte,
                FilterOp::Lt => SqlBinaryOperator::Lt,
                FilterOp::Lte => SqlBinaryOperator::Lte,
                _ => SqlBinaryOperator::Like,
            };
            SqlExpr::binary(op, base_expr, SqlExpr::Literal(value))
        }
    }
}

/// List operand: arrays as-is, strings split on commas outside quotes.
fn list_values(val: &Value, is_numeric: bool) -> Vec<Value> {
    let raw: Vec<Value> = match val {
        Value::Array(items) => items.clone(),
        Value::String(s) => split_csv_values(s).into_iter().map(Value::String).collect(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };
    raw.into_iter()
        .map(|v| handle_single_value(v, is_numeric))
        .collect()
}

fn scalar_value(val: &Value, is_numeric: bool) -> Value {
    let single = match val {
        Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    };
    handle_single_value(single, is_numeric)
}

fn handle_single_value(v: Value, is_numeric: bool) -> Value {
    let Value::String(s) = v else {
        return v;
    };
    let s = s.trim_matches(|c: char| matches!(c, '\t' | '\n' | ' ' | '\'' | '"'));
    if s == NULL_SENTINEL {
        return Value::Null;
    }
    if s == EMPTY_STRING_SENTINEL {
        return Value::String(String::new());
    }
    if is_numeric {
        if let Some(n) = string_to_num(s) {
            return n;
        }
    }
    Value::String(s.to_string())
}

/// Integer if it parses as one, else a finite float, else `None`.
pub(crate) fn string_to_num(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

/// `a, 'b,c', "d"` -> `[a, 'b,c', "d"]`; quotes are stripped later.
pub fn split_csv_values(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in s.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == ',' => {
                out.push(std::mem::take(&mut current).trim().to_string());
            }
            None => current.push(c),
        }
    }
    let last = current.trim();
    if !last.is_empty() || !out.is_empty() {
        out.push(last.to_string());
    }
    out
}
