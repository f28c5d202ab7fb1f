//! Time projection and time-window predicates.

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDateTime;

use crate::dialect::DialectAdapter;
use crate::models::TableColumn;
use crate::sql_ast::{SelectItem, SqlBinaryOperator, SqlExpr, SqlRenderer};

use super::resolve::column_expr;

/// Output alias of the truncated time column.
pub const DTTM_ALIAS: &str = "__timestamp";

const EPOCH_S: &str = "epoch_s";
const EPOCH_MS: &str = "epoch_ms";

/// Epoch conversion first, then grain truncation. The plain column is used
/// untouched when neither applies.
pub(crate) fn timestamp_expr(
    col: &TableColumn,
    time_grain: Option<&str>,
    dialect: &dyn DialectAdapter,
) -> SqlExpr {
    let pdf = col.python_date_format.as_deref();
    let is_epoch = matches!(pdf, Some(EPOCH_S) | Some(EPOCH_MS));
    let grain = time_grain.and_then(|g| dialect.time_grain(g));
    if let Some(requested) = time_grain {
        if grain.is_none() {
            tracing::debug!(
                grain = requested,
                engine = dialect.engine(),
                "time grain not supported by dialect, ignoring"
            );
        }
    }
    if col.expression.is_none() && grain.is_none() && !is_epoch {
        return SqlExpr::column(&col.column_name);
    }

    let mut expr = SqlRenderer::new(dialect).render_expr(&column_expr(col));
    if is_epoch {
        let format = match pdf {
            Some(EPOCH_S) => dialect.epoch_to_dttm().map(str::to_string),
            _ => dialect.epoch_ms_to_dttm(),
        };
        match format {
            Some(format) => expr = format.replace("{col}", &expr),
            None => tracing::warn!(
                column = %col.column_name,
                engine = dialect.engine(),
                "no epoch conversion for dialect, using raw column"
            ),
        }
    }
    if let Some(grain) = grain {
        expr = grain.apply(&expr);
    }
    SqlExpr::Raw(expr)
}

pub(crate) fn timestamp_select_item(
    col: &TableColumn,
    time_grain: Option<&str>,
    dialect: &dyn DialectAdapter,
) -> SelectItem {
    SelectItem::aliased(timestamp_expr(col, time_grain, dialect), DTTM_ALIAS)
}

/// `col >= <from> AND col <= <to>` for the bounds that are set.
pub(crate) fn time_filter(
    col: &TableColumn,
    from: Option<NaiveDateTime>,
    to: Option<NaiveDateTime>,
    dialect: &dyn DialectAdapter,
) -> Option<SqlExpr> {
    let mut parts = Vec::new();
    if let Some(from) = from {
        parts.push(SqlExpr::binary(
            SqlBinaryOperator::Gte,
            column_expr(col),
            SqlExpr::Raw(dttm_sql_literal(col, &from, dialect)),
        ));
    }
    if let Some(to) = to {
        parts.push(SqlExpr::binary(
            SqlBinaryOperator::Lte,
            column_expr(col),
            SqlExpr::Raw(dttm_sql_literal(col, &to, dialect)),
        ));
    }
    if parts.is_empty() {
        None
    } else {
        Some(SqlExpr::and(parts))
    }
}

/// Bound literal: `database_expression`, then the column's date format, then
/// the dialect's native conversion, then a quoted ISO string.
pub(crate) fn dttm_sql_literal(
    col: &TableColumn,
    dttm: &NaiveDateTime,
    dialect: &dyn DialectAdapter,
) -> String {
    if let Some(db_expr) = &col.database_expression {
        return db_expr.replace("{}", &dttm.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    match col.python_date_format.as_deref() {
        Some(EPOCH_S) => epoch_literal(dttm.and_utc().timestamp_millis(), 1000),
        Some(EPOCH_MS) => epoch_literal(dttm.and_utc().timestamp_millis(), 1),
        Some(pattern) => match format_pattern(dttm, pattern) {
            Some(formatted) => format!("'{formatted}'"),
            None => {
                tracing::warn!(column = %col.column_name, pattern, "invalid date format, using ISO");
                format!("'{}'", dttm.format("%Y-%m-%d %H:%M:%S"))
            }
        },
        None => dialect
            .convert_dttm(col.data_type.as_deref().unwrap_or_default(), dttm)
            .unwrap_or_else(|| format!("'{}'", dttm.format("%Y-%m-%d %H:%M:%S%.6f"))),
    }
}

fn format_pattern(dttm: &NaiveDateTime, pattern: &str) -> Option<String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return None;
    }
    Some(dttm.format_with_items(items.into_iter()).to_string())
}

fn epoch_literal(millis: i64, divisor: i64) -> String {
    if millis % divisor == 0 {
        (millis / divisor).to_string()
    } else {
        (millis as f64 / divisor as f64).to_string()
    }
}
