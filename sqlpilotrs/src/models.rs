//! Dataset metadata: the columns and metrics a chart query compiles against.

use serde::{de, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SqlPilotError};
use crate::query_spec::Aggregate;

/// A physical table or a virtual (SQL-defined) dataset bound to one database.
#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    pub name: String,
    /// Connection name in the [`ConnectionManager`](crate::backends::ConnectionManager).
    pub database: String,
    pub schema: Option<String>,
    pub source: DatasetSource,
    pub main_dttm_col: Option<String>,
    /// Defaults merged under request parameters when expanding templates.
    pub template_params: Map<String, Value>,
    /// Predicate applied when listing distinct column values.
    pub fetch_values_predicate: Option<String>,
    pub columns: Vec<TableColumn>,
    pub metrics: Vec<SqlMetric>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSource {
    Table(String),
    Sql(String),
}

impl<'de> Deserialize<'de> for Dataset {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            name: String,
            database: String,
            schema: Option<String>,
            table: Option<String>,
            sql: Option<String>,
            main_dttm_col: Option<String>,
            #[serde(default)]
            template_params: Map<String, Value>,
            fetch_values_predicate: Option<String>,
            #[serde(default)]
            columns: Vec<TableColumn>,
            #[serde(default)]
            metrics: Vec<SqlMetric>,
            description: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let source = match (raw.table, raw.sql) {
            (Some(_), Some(_)) => {
                return Err(de::Error::custom(
                    "dataset must set exactly one of table or sql",
                ))
            }
            (Some(table), None) => DatasetSource::Table(table),
            (None, Some(sql)) => DatasetSource::Sql(sql),
            (None, None) => return Err(de::Error::custom("either table or sql must be specified")),
        };

        Ok(Dataset {
            name: raw.name,
            database: raw.database,
            schema: raw.schema,
            source,
            main_dttm_col: raw.main_dttm_col,
            template_params: raw.template_params,
            fetch_values_predicate: raw.fetch_values_predicate,
            columns: raw.columns,
            metrics: raw.metrics,
            description: raw.description,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableColumn {
    #[serde(alias = "name")]
    pub column_name: String,
    #[serde(rename = "type", default)]
    pub data_type: Option<String>,
    /// SQL used in place of the bare column.
    pub expression: Option<String>,
    #[serde(default)]
    pub is_dttm: bool,
    /// `epoch_s`, `epoch_ms`, or a strftime pattern for string-typed times.
    pub python_date_format: Option<String>,
    /// `{}`-style template applied to the formatted bound, e.g. `TO_DATE('{}', 'YYYY-MM-DD')`.
    pub database_expression: Option<String>,
    #[serde(default = "default_true")]
    pub groupby: bool,
    #[serde(default = "default_true")]
    pub filterable: bool,
    #[serde(default)]
    pub sum: bool,
    #[serde(default)]
    pub avg: bool,
    #[serde(default)]
    pub max: bool,
    #[serde(default)]
    pub min: bool,
    #[serde(default)]
    pub count_distinct: bool,
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

const NUMERIC_TYPES: &[&str] = &[
    "INT", "LONG", "DOUBLE", "FLOAT", "REAL", "NUMERIC", "DECIMAL", "NUMBER", "MONEY",
];
const TEMPORAL_TYPES: &[&str] = &["DATE", "TIME"];

impl TableColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            column_name: name.into(),
            data_type: Some(data_type.into()),
            expression: None,
            is_dttm: false,
            python_date_format: None,
            database_expression: None,
            groupby: true,
            filterable: true,
            sum: false,
            avg: false,
            max: false,
            min: false,
            count_distinct: false,
            description: None,
        }
    }

    fn type_upper(&self) -> String {
        self.data_type
            .as_deref()
            .unwrap_or_default()
            .to_ascii_uppercase()
    }

    pub fn is_numeric(&self) -> bool {
        let ty = self.type_upper();
        NUMERIC_TYPES.iter().any(|t| ty.contains(t))
    }

    pub fn is_temporal(&self) -> bool {
        if self.is_dttm {
            return true;
        }
        let ty = self.type_upper();
        TEMPORAL_TYPES.iter().any(|t| ty.contains(t))
    }

    /// Metrics implied by the aggregate flags, in a stable order.
    pub fn generated_metrics(&self) -> Vec<MetricDefinition> {
        let flags = [
            (self.sum, Aggregate::Sum, "sum"),
            (self.avg, Aggregate::Avg, "avg"),
            (self.max, Aggregate::Max, "max"),
            (self.min, Aggregate::Min, "min"),
            (self.count_distinct, Aggregate::CountDistinct, "count_distinct"),
        ];
        flags
            .into_iter()
            .filter(|(on, _, _)| *on)
            .map(|(_, agg, prefix)| MetricDefinition {
                name: format!("{prefix}__{}", self.column_name),
                kind: MetricKind::Aggregate {
                    agg,
                    column: self.column_name.clone(),
                },
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlMetric {
    #[serde(alias = "name")]
    pub metric_name: String,
    pub expression: String,
    pub metric_type: Option<String>,
    pub verbose_name: Option<String>,
    pub description: Option<String>,
}

/// A metric resolved against a dataset, before dialect rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub name: String,
    pub kind: MetricKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    /// Raw SQL aggregate expression.
    Expression(String),
    /// Aggregate over a dataset column.
    Aggregate { agg: Aggregate, column: String },
    CountStar,
}

pub const COUNT_METRIC: &str = "count";
pub const COUNT_STAR_METRIC: &str = "count(*)";

impl Dataset {
    pub fn table_name(&self) -> Option<&str> {
        match &self.source {
            DatasetSource::Table(t) => Some(t),
            DatasetSource::Sql(_) => None,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.source, DatasetSource::Sql(_))
    }

    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|c| c.column_name == name)
    }

    /// Explicit metrics, then the implicit row count, then flag-generated ones.
    pub fn metric(&self, name: &str) -> Option<MetricDefinition> {
        if let Some(m) = self.metrics.iter().find(|m| m.metric_name == name) {
            return Some(MetricDefinition {
                name: m.metric_name.clone(),
                kind: MetricKind::Expression(m.expression.clone()),
            });
        }
        if name == COUNT_METRIC || name.eq_ignore_ascii_case(COUNT_STAR_METRIC) {
            return Some(MetricDefinition {
                name: name.to_string(),
                kind: MetricKind::CountStar,
            });
        }
        self.columns
            .iter()
            .flat_map(|c| c.generated_metrics())
            .find(|m| m.name == name)
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.iter().map(|m| m.metric_name.clone()).collect();
        names.push(COUNT_METRIC.to_string());
        names.extend(
            self.columns
                .iter()
                .flat_map(|c| c.generated_metrics())
                .map(|m| m.name),
        );
        names
    }

    /// The configured main datetime column, else the first datetime column.
    pub fn main_dttm(&self) -> Option<&TableColumn> {
        match &self.main_dttm_col {
            Some(name) => self.column(name).filter(|c| c.is_temporal()),
            None => self.columns.iter().find(|c| c.is_dttm),
        }
    }

    /// Structural checks performed when a dataset is registered.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.column_name.as_str()) {
                return Err(SqlPilotError::Validation(format!(
                    "dataset {} has duplicate column {}",
                    self.name, col.column_name
                )));
            }
        }
        let mut metric_names = std::collections::HashSet::new();
        for metric in &self.metrics {
            if !metric_names.insert(metric.metric_name.as_str()) {
                return Err(SqlPilotError::Validation(format!(
                    "dataset {} has duplicate metric {}",
                    self.name, metric.metric_name
                )));
            }
        }
        if let Some(main) = &self.main_dttm_col {
            match self.column(main) {
                Some(col) if col.is_temporal() => {}
                Some(_) => {
                    return Err(SqlPilotError::Validation(format!(
                        "main_dttm_col {main} of dataset {} is not a datetime column",
                        self.name
                    )))
                }
                None => {
                    return Err(SqlPilotError::Validation(format!(
                        "main_dttm_col {main} not found in dataset {}",
                        self.name
                    )))
                }
            }
        }
        Ok(())
    }
}
