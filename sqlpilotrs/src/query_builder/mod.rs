//! Compiles a [`QuerySpec`] against a [`Dataset`] into backend SQL.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::dialect::DialectAdapter;
use crate::error::{Result, SqlPilotError};
use crate::models::{Dataset, DatasetSource, TableColumn};
use crate::normalizer::{normalize, RawResult, ResultSet};
use crate::query_spec::{MetricRef, QuerySpec};
use crate::sql_ast::{FromItem, OrderItem, SelectQuery, SortDirection, SqlExpr, SqlRenderer};
use crate::sql_parse::strip_comments;
use crate::template::{TemplateContext, TemplateProcessor};

mod filters;
mod resolve;
mod series;
mod time;

pub use filters::split_csv_values;
pub use series::{inner_alias, INNER_METRIC_ALIAS, SERIES_SUBQUERY_ALIAS};
pub use time::DTTM_ALIAS;

use resolve::{column_expr, column_select_item, ResolvedMetric};

/// Alias given to a virtual dataset's SQL in FROM.
pub const VIRTUAL_TABLE_ALIAS: &str = "expr_qry";

/// Executes the top-N prequery on backends without inner-join support.
#[async_trait]
pub trait PrequeryRunner: Send + Sync {
    async fn run_prequery(&self, sql: &str) -> Result<RawResult>;
}

/// The compiled statement plus the prequeries that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub sql: String,
    pub prequeries: Vec<String>,
    /// Set when `sql` itself was appended to `prequeries`.
    pub is_prequery: bool,
}

impl CompiledQuery {
    /// Prequeries then the main statement, `;`-separated and `;`-terminated.
    pub fn display_sql(&self) -> String {
        let mut parts: Vec<&str> = self.prequeries.iter().map(String::as_str).collect();
        if !self.is_prequery {
            parts.push(&self.sql);
        }
        format!("{};", parts.join(";\n\n"))
    }
}

pub struct QueryCompiler {
    dialect: Arc<dyn DialectAdapter>,
    template: TemplateContext,
}

impl QueryCompiler {
    pub fn new(dialect: Arc<dyn DialectAdapter>) -> Self {
        Self {
            dialect,
            template: TemplateContext::default(),
        }
    }

    pub fn with_template_context(mut self, context: TemplateContext) -> Self {
        self.template = context;
        self
    }

    pub fn dialect(&self) -> &dyn DialectAdapter {
        self.dialect.as_ref()
    }

    /// True when the series limit must be resolved with a separate round trip.
    pub fn needs_prequery(&self, spec: &QuerySpec) -> bool {
        self.has_series_limit(spec) && !self.dialect.supports_inner_joins()
    }

    fn has_series_limit(&self, spec: &QuerySpec) -> bool {
        spec.is_timeseries
            && spec.timeseries_limit > 0
            && !spec.groupby.is_empty()
            && !self.dialect.time_groupby_inline()
    }

    /// Compile, running the top-N prequery through `runner` when needed.
    pub async fn compile(
        &self,
        spec: &QuerySpec,
        dataset: &Dataset,
        runner: &dyn PrequeryRunner,
    ) -> Result<CompiledQuery> {
        if !self.needs_prequery(spec) {
            return self.compile_select(spec, dataset, None);
        }

        let sub_spec = Self::series_prequery_spec(spec);
        let prequery = self.compile_select(&sub_spec, dataset, None)?;
        tracing::debug!(dataset = %dataset.name, sql = %prequery.sql, "running top-N prequery");
        let raw = runner.run_prequery(&prequery.sql).await?;
        let groups = normalize(&raw.columns, raw.rows);

        let mut compiled = self.compile_select(spec, dataset, Some(&groups))?;
        compiled.prequeries = prequery.prequeries;
        if compiled.is_prequery {
            compiled.prequeries.push(compiled.sql.clone());
        }
        Ok(compiled)
    }

    /// The request used to fetch the top-N dimension tuples.
    fn series_prequery_spec(spec: &QuerySpec) -> QuerySpec {
        QuerySpec {
            prequeries: spec.prequeries.clone(),
            is_prequery: true,
            is_timeseries: false,
            row_limit: Some(spec.timeseries_limit),
            from_dttm: spec.inner_from_dttm.or(spec.from_dttm),
            to_dttm: spec.inner_to_dttm.or(spec.to_dttm),
            order_desc: true,
            timeseries_limit: 0,
            timeseries_limit_metric: None,
            inner_from_dttm: None,
            inner_to_dttm: None,
            ..spec.clone()
        }
    }

    /// Deterministic compilation. `top_groups` carries the prequery result
    /// when the series limit is resolved by round trip.
    pub fn compile_select(
        &self,
        spec: &QuerySpec,
        dataset: &Dataset,
        top_groups: Option<&ResultSet>,
    ) -> Result<CompiledQuery> {
        let dialect = self.dialect.as_ref();
        let template = self.template_context(spec, dataset);

        let granularity = self.resolve_granularity(spec, dataset);
        if granularity.is_none() && spec.is_timeseries {
            return Err(SqlPilotError::Compilation(
                "Datetime column not provided as part table configuration \
                 and is required by this type of chart"
                    .to_string(),
            ));
        }
        if spec.groupby.is_empty() && spec.metrics.is_empty() && spec.columns.is_empty() {
            return Err(SqlPilotError::Compilation("Empty query?".to_string()));
        }

        let mut metrics: Vec<ResolvedMetric> = spec
            .metrics
            .iter()
            .map(|m| resolve::resolve_metric(dataset, m, dialect))
            .collect::<Result<_>>()?;
        let main_metric_expr = metrics
            .first()
            .map(|m| m.expr.clone())
            .unwrap_or_else(|| SqlExpr::raw("COUNT(*)"));

        let mut query = SelectQuery {
            from: self.from_clause(dataset, &template)?,
            ..Default::default()
        };

        let dimensions: Vec<&TableColumn> = spec
            .groupby
            .iter()
            .map(|name| resolve::resolve_dimension(dataset, name))
            .collect::<Result<_>>()?;
        let columns_mode = dimensions.is_empty() && !spec.columns.is_empty();

        if !dimensions.is_empty() {
            for col in &dimensions {
                query.select.push(column_select_item(col));
                query.group_by.push(column_expr(col));
            }
        } else if columns_mode {
            for name in &spec.columns {
                let col = resolve::resolve_dimension(dataset, name)?;
                query.select.push(column_select_item(col));
            }
            metrics.clear();
        }

        let mut time_filter = None;
        if let Some(dttm_col) = granularity {
            if spec.is_timeseries {
                let grain = spec.extras.time_grain_sqla.as_deref();
                query
                    .select
                    .push(time::timestamp_select_item(dttm_col, grain, dialect));
                query
                    .group_by
                    .push(time::timestamp_expr(dttm_col, grain, dialect));
            }
            time_filter = time::time_filter(dttm_col, spec.from_dttm, spec.to_dttm, dialect);
        }

        query.select.extend(metrics.iter().map(ResolvedMetric::select_item));
        if columns_mode {
            query.group_by.clear();
        }

        let mut where_clause = filters::build_filters(dataset, &spec.filters);
        let mut having_clause = Vec::new();
        if let Some(extra_where) = non_empty(spec.extras.where_clause.as_deref()) {
            let expanded = TemplateProcessor::expand(extra_where, &template)?;
            where_clause.push(SqlExpr::Raw(format!("({expanded})")));
        }
        if let Some(extra_having) = non_empty(spec.extras.having.as_deref()) {
            let expanded = TemplateProcessor::expand(extra_having, &template)?;
            having_clause.push(SqlExpr::Raw(format!("({expanded})")));
        }
        query.filters = time_filter.into_iter().chain(where_clause.clone()).collect();
        query.having = having_clause;

        let direction = |ascending: bool| {
            if ascending {
                SortDirection::Asc
            } else {
                SortDirection::Desc
            }
        };
        if spec.orderby.is_empty() {
            if !columns_mode {
                query.order_by.push(OrderItem {
                    expr: main_metric_expr.clone(),
                    direction: direction(!spec.order_desc),
                });
            }
        } else {
            for (key, ascending) in &spec.orderby {
                query.order_by.push(OrderItem {
                    expr: resolve::resolve_order_key(dataset, key, dialect)?,
                    direction: direction(*ascending),
                });
            }
        }

        query.limit = spec.row_limit.filter(|limit| *limit > 0);

        if self.has_series_limit(spec) {
            if dialect.supports_inner_joins() {
                let dttm_col = granularity.ok_or_else(|| {
                    SqlPilotError::Compilation("series limit requires a time column".to_string())
                })?;
                let inner_time_filter = time::time_filter(
                    dttm_col,
                    spec.inner_from_dttm.or(spec.from_dttm),
                    spec.inner_to_dttm.or(spec.to_dttm),
                    dialect,
                );
                let order_metric = spec
                    .timeseries_limit_metric
                    .as_ref()
                    .map(|m| resolve::resolve_metric(dataset, m, dialect).map(|r| r.expr))
                    .transpose()?;
                query.joins.push(series::inner_join(series::SeriesSubquery {
                    dimensions: &dimensions,
                    from: query.from.clone(),
                    filters: where_clause.into_iter().chain(inner_time_filter).collect(),
                    main_metric: main_metric_expr,
                    order_metric,
                    direction: direction(!spec.order_desc),
                    limit: spec.timeseries_limit,
                }));
            } else {
                let groups = top_groups.ok_or_else(|| {
                    SqlPilotError::Compilation(format!(
                        "top groups are required to limit series on {}",
                        dialect.engine()
                    ))
                })?;
                let labels: Vec<String> = spec.metrics.iter().map(MetricRef::label).collect();
                query
                    .filters
                    .push(series::top_groups_predicate(dataset, groups, &labels)?);
            }
        }

        let sql = SqlRenderer::new(dialect).render_select(&query);
        let mut prequeries = spec.prequeries.clone();
        if spec.is_prequery {
            prequeries.push(sql.clone());
        }
        Ok(CompiledQuery {
            sql,
            prequeries,
            is_prequery: spec.is_prequery,
        })
    }

    /// Distinct values of one column, for filter pickers.
    pub fn values_for_column(
        &self,
        dataset: &Dataset,
        column: &str,
        limit: Option<u64>,
    ) -> Result<String> {
        let col = resolve::resolve_dimension(dataset, column)?;
        let mut template = self.template.clone();
        template.merge_defaults(&dataset.template_params);

        let mut query = SelectQuery {
            distinct: true,
            select: vec![column_select_item(col)],
            from: self.from_clause(dataset, &template)?,
            limit: limit.filter(|l| *l > 0),
            ..Default::default()
        };
        if let Some(predicate) = non_empty(dataset.fetch_values_predicate.as_deref()) {
            let expanded = TemplateProcessor::expand(predicate, &template)?;
            query.filters.push(SqlExpr::Raw(format!("({expanded})")));
        }
        Ok(SqlRenderer::new(self.dialect.as_ref()).render_select(&query))
    }

    /// `granularity` when it names a datetime column, else the dataset's main one.
    fn resolve_granularity<'a>(
        &self,
        spec: &QuerySpec,
        dataset: &'a Dataset,
    ) -> Option<&'a TableColumn> {
        spec.granularity
            .as_deref()
            .and_then(|name| dataset.column(name))
            .filter(|col| col.is_temporal())
            .or_else(|| dataset.main_dttm())
    }

    fn from_clause(&self, dataset: &Dataset, template: &TemplateContext) -> Result<FromItem> {
        match &dataset.source {
            DatasetSource::Table(name) => Ok(FromItem::Table {
                schema: dataset.schema.clone(),
                name: name.clone(),
                alias: None,
            }),
            DatasetSource::Sql(sql) => {
                let expanded = TemplateProcessor::expand(sql, template)?;
                Ok(FromItem::RawSubquery {
                    sql: strip_comments(&expanded),
                    alias: VIRTUAL_TABLE_ALIAS.to_string(),
                })
            }
        }
    }

    /// Request-scoped template values layered over the compiler's context
    /// and the dataset defaults.
    fn template_context(&self, spec: &QuerySpec, dataset: &Dataset) -> TemplateContext {
        let mut ctx = self.template.clone();
        ctx.filters = spec.filters.clone();
        ctx.merge_defaults(&dataset.template_params);
        let mut request = serde_json::Map::new();
        request.insert(
            "groupby".into(),
            Value::from(spec.groupby.clone()),
        );
        request.insert(
            "metrics".into(),
            Value::from(spec.metrics.iter().map(MetricRef::label).collect::<Vec<_>>()),
        );
        request.insert(
            "row_limit".into(),
            spec.row_limit.map(Value::from).unwrap_or(Value::Null),
        );
        for (key, dttm) in [("from_dttm", spec.from_dttm), ("to_dttm", spec.to_dttm)] {
            request.insert(
                key.into(),
                dttm.map(|d| Value::String(d.format("%Y-%m-%d %H:%M:%S").to_string()))
                    .unwrap_or(Value::Null),
            );
        }
        ctx.merge_defaults(&request);
        ctx
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{HiveDialect, PostgresDialect};

    fn dataset() -> Dataset {
        serde_yaml::from_str(
            r#"
name: events
database: main
table: events
main_dttm_col: ds
columns:
  - column_name: ds
    type: TIMESTAMP
    is_dttm: true
  - column_name: country
    type: VARCHAR
"#,
        )
        .unwrap()
    }

    #[test]
    fn display_sql_joins_prequeries() {
        let compiled = CompiledQuery {
            sql: "SELECT 2".into(),
            prequeries: vec!["SELECT 1".into()],
            is_prequery: false,
        };
        assert_eq!(compiled.display_sql(), "SELECT 1;\n\nSELECT 2;");
    }

    #[test]
    fn prequery_flag_appends_to_list() {
        let compiler = QueryCompiler::new(Arc::new(PostgresDialect));
        let spec = QuerySpec {
            metrics: vec![MetricRef::named("count")],
            prequeries: vec!["SELECT 0".into()],
            is_prequery: true,
            ..Default::default()
        };
        let compiled = compiler.compile_select(&spec, &dataset(), None).unwrap();
        assert_eq!(compiled.prequeries.len(), 2);
        assert_eq!(compiled.prequeries[1], compiled.sql);
        assert!(compiled.display_sql().ends_with(&format!("{};", compiled.sql)));
    }

    #[test]
    fn granularity_falls_back_to_main_dttm() {
        let compiler = QueryCompiler::new(Arc::new(PostgresDialect));
        let spec = QuerySpec {
            granularity: Some("country".into()),
            metrics: vec![MetricRef::named("count")],
            is_timeseries: true,
            ..Default::default()
        };
        let sql = compiler.compile_select(&spec, &dataset(), None).unwrap().sql;
        assert!(sql.starts_with("SELECT \"ds\" AS \"__timestamp\""), "{sql}");
    }

    #[test]
    fn prequery_dialect_requires_groups() {
        let compiler = QueryCompiler::new(Arc::new(HiveDialect));
        let spec = QuerySpec {
            metrics: vec![MetricRef::named("count")],
            groupby: vec!["country".into()],
            is_timeseries: true,
            timeseries_limit: 5,
            ..Default::default()
        };
        assert!(compiler.needs_prequery(&spec));
        assert!(matches!(
            compiler.compile_select(&spec, &dataset(), None),
            Err(SqlPilotError::Compilation(_))
        ));
    }

    #[test]
    fn values_for_column_is_distinct_and_filtered() {
        let mut ds = dataset();
        ds.fetch_values_predicate = Some("country != '{{ excluded }}'".into());
        ds.template_params.insert("excluded".into(), serde_json::json!("XX"));
        let compiler = QueryCompiler::new(Arc::new(PostgresDialect));
        let sql = compiler.values_for_column(&ds, "country", Some(100)).unwrap();
        assert_eq!(
            sql,
            "SELECT DISTINCT \"country\"\nFROM \"events\"\nWHERE (country != 'XX')\nLIMIT 100"
        );
        assert!(compiler.values_for_column(&ds, "nope", None).is_err());
    }
}
