//! Top-N series restriction for timeseries queries with a series limit.

use crate::error::{Result, SqlPilotError};
use crate::models::{Dataset, TableColumn};
use crate::normalizer::ResultSet;
use crate::sql_ast::{
    FromItem, Join, OrderItem, SelectItem, SelectQuery, SortDirection, SqlBinaryOperator, SqlExpr,
    SqlJoinType,
};

use super::resolve::column_expr;

/// Alias of the top-N subquery in the inner-join form.
pub const SERIES_SUBQUERY_ALIAS: &str = "series_limit";
/// Alias of the ranking metric inside the subquery.
pub const INNER_METRIC_ALIAS: &str = "mme_inner__";

/// Inner dimension alias; the suffix keeps it distinct from the outer column.
pub fn inner_alias(dimension: &str) -> String {
    format!("{dimension}__")
}

pub(crate) struct SeriesSubquery<'a> {
    pub dimensions: &'a [&'a TableColumn],
    pub from: FromItem,
    pub filters: Vec<SqlExpr>,
    pub main_metric: SqlExpr,
    /// Ranking expression when it differs from the main metric.
    pub order_metric: Option<SqlExpr>,
    pub direction: SortDirection,
    pub limit: u64,
}

/// `JOIN (<top-N groups>) AS series_limit ON dim = series_limit.dim__ ...`
pub(crate) fn inner_join(sub: SeriesSubquery<'_>) -> Join {
    let mut select: Vec<SelectItem> = sub
        .dimensions
        .iter()
        .map(|col| SelectItem::aliased(column_expr(col), inner_alias(&col.column_name)))
        .collect();
    select.push(SelectItem::aliased(sub.main_metric, INNER_METRIC_ALIAS));

    let order_expr = sub
        .order_metric
        .unwrap_or_else(|| SqlExpr::column(INNER_METRIC_ALIAS));

    let query = SelectQuery {
        select,
        from: sub.from,
        filters: sub.filters,
        group_by: sub.dimensions.iter().map(|col| column_expr(col)).collect(),
        order_by: vec![OrderItem {
            expr: order_expr,
            direction: sub.direction,
        }],
        limit: Some(sub.limit),
        ..Default::default()
    };

    let on = sub
        .dimensions
        .iter()
        .map(|col| {
            SqlExpr::binary(
                SqlBinaryOperator::Eq,
                column_expr(col),
                SqlExpr::qualified(SERIES_SUBQUERY_ALIAS, inner_alias(&col.column_name)),
            )
        })
        .collect();

    Join {
        join_type: SqlJoinType::Inner,
        source: FromItem::Subquery {
            query: Box::new(query),
            alias: SERIES_SUBQUERY_ALIAS.to_string(),
        },
        on,
    }
}

/// OR-of-ANDs membership test over the prequery's dimension tuples.
pub(crate) fn top_groups_predicate(
    dataset: &Dataset,
    groups: &ResultSet,
    metric_labels: &[String],
) -> Result<SqlExpr> {
    let dimensions: Vec<&str> = groups
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|name| !metric_labels.iter().any(|m| m == name))
        .collect();

    if groups.data.is_empty() {
        return Ok(SqlExpr::raw("1 = 0"));
    }

    let mut alternatives = Vec::with_capacity(groups.data.len());
    for row in &groups.data {
        let mut conjuncts = Vec::with_capacity(dimensions.len());
        for dim in &dimensions {
            let col = dataset.column(dim).ok_or_else(|| {
                SqlPilotError::Compilation(format!(
                    "Prequery returned unknown column '{dim}'"
                ))
            })?;
            let value = row.get(*dim).cloned().unwrap_or(serde_json::Value::Null);
            conjuncts.push(if value.is_null() {
                SqlExpr::IsNull {
                    expr: Box::new(column_expr(col)),
                    negated: false,
                }
            } else {
                SqlExpr::binary(
                    SqlBinaryOperator::Eq,
                    column_expr(col),
                    SqlExpr::Literal(value),
                )
            });
        }
        alternatives.push(SqlExpr::And(conjuncts));
    }
    Ok(SqlExpr::Or(alternatives))
}
