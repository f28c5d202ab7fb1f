use crate::dialect::DialectAdapter;
use crate::error::{Result, SqlPilotError};
use crate::models::{Dataset, MetricKind, TableColumn};
use crate::query_spec::{AdhocMetric, ExpressionType, MetricRef};
use crate::sql_ast::{SelectItem, SqlExpr};

/// A metric ready for projection and ordering.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedMetric {
    pub expr: SqlExpr,
    pub label: String,
}

impl ResolvedMetric {
    pub fn select_item(&self) -> SelectItem {
        SelectItem::aliased(self.expr.clone(), self.label.clone())
    }
}

/// The column itself, or its SQL expression when one is defined.
pub(crate) fn column_expr(col: &TableColumn) -> SqlExpr {
    match &col.expression {
        Some(expression) => SqlExpr::raw(expression.trim()),
        None => SqlExpr::column(&col.column_name),
    }
}

/// Projection for a dimension; expressions are labelled with the column name.
pub(crate) fn column_select_item(col: &TableColumn) -> SelectItem {
    match &col.expression {
        Some(_) => SelectItem::aliased(column_expr(col), col.column_name.clone()),
        None => SelectItem {
            expr: column_expr(col),
            alias: None,
        },
    }
}

pub(crate) fn resolve_dimension<'a>(dataset: &'a Dataset, name: &str) -> Result<&'a TableColumn> {
    dataset
        .column(name)
        .ok_or_else(|| SqlPilotError::Compilation(format!("Dimension '{name}' is not valid")))
}

pub(crate) fn resolve_metric(
    dataset: &Dataset,
    metric: &MetricRef,
    dialect: &dyn DialectAdapter,
) -> Result<ResolvedMetric> {
    match metric {
        MetricRef::Named(name) => {
            let def = dataset
                .metric(name)
                .ok_or_else(|| invalid_metric(name))?;
            let expr = match def.kind {
                MetricKind::Expression(sql) => SqlExpr::raw(sql),
                MetricKind::CountStar => SqlExpr::raw("COUNT(*)"),
                MetricKind::Aggregate { agg, column } => {
                    let inner = match dataset.column(&column) {
                        Some(col) => column_expr(col),
                        None => SqlExpr::column(column),
                    };
                    SqlExpr::raw(dialect.render_aggregation(agg, &render_inner(&inner, dialect)))
                }
            };
            Ok(ResolvedMetric {
                expr,
                label: def.name,
            })
        }
        MetricRef::Adhoc(adhoc) => resolve_adhoc(dataset, adhoc, dialect),
    }
}

fn resolve_adhoc(
    dataset: &Dataset,
    adhoc: &AdhocMetric,
    dialect: &dyn DialectAdapter,
) -> Result<ResolvedMetric> {
    let label = adhoc.label();
    let expr = match adhoc.expression_type {
        ExpressionType::Simple => {
            let column = adhoc
                .column
                .as_ref()
                .ok_or_else(|| invalid_metric(&label))?;
            let agg = adhoc.aggregate.ok_or_else(|| invalid_metric(&label))?;
            // Unknown columns are passed through as bare identifiers.
            let inner = match dataset.column(column.name()) {
                Some(col) => column_expr(col),
                None => SqlExpr::column(column.name()),
            };
            SqlExpr::raw(dialect.render_aggregation(agg, &render_inner(&inner, dialect)))
        }
        ExpressionType::Sql => {
            let sql = adhoc
                .sql_expression
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| invalid_metric(&label))?;
            SqlExpr::raw(sql.trim())
        }
    };
    Ok(ResolvedMetric { expr, label })
}

fn render_inner(expr: &SqlExpr, dialect: &dyn DialectAdapter) -> String {
    crate::sql_ast::SqlRenderer::new(dialect).render_expr(expr)
}

/// An ordering key: a metric (saved or adhoc) or a dataset column.
pub(crate) fn resolve_order_key(
    dataset: &Dataset,
    key: &MetricRef,
    dialect: &dyn DialectAdapter,
) -> Result<SqlExpr> {
    if let MetricRef::Named(name) = key {
        if dataset.metric(name).is_none() {
            if let Some(col) = dataset.column(name) {
                return Ok(column_expr(col));
            }
        }
    }
    resolve_metric(dataset, key, dialect).map(|m| m.expr)
}

fn invalid_metric(name: &str) -> SqlPilotError {
    SqlPilotError::Compilation(format!("Metric '{name}' is not valid"))
}
