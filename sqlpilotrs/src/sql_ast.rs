use serde_json::Value;

use crate::dialect::DialectAdapter;
use crate::query_spec::Aggregate;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column {
        table: Option<String>,
        name: String,
    },
    /// Pre-rendered SQL: column expressions, metric expressions, grain output.
    Raw(String),
    Literal(Value),
    Aggregate {
        agg: Aggregate,
        expr: Box<SqlExpr>,
    },
    BinaryOp {
        op: SqlBinaryOperator,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    IsNull {
        expr: Box<SqlExpr>,
        negated: bool,
    },
    Not(Box<SqlExpr>),
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBinaryOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl SqlExpr {
    pub fn column(name: impl Into<String>) -> Self {
        SqlExpr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        SqlExpr::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        SqlExpr::Raw(sql.into())
    }

    pub fn binary(op: SqlBinaryOperator, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `AND` of `parts`, collapsing the single-element case.
    pub fn and(mut parts: Vec<SqlExpr>) -> Self {
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            SqlExpr::And(parts)
        }
    }

    pub fn or(mut parts: Vec<SqlExpr>) -> Self {
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            SqlExpr::Or(parts)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn aliased(expr: SqlExpr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table {
        schema: Option<String>,
        name: String,
        alias: Option<String>,
    },
    /// Virtual dataset text, already template-expanded.
    RawSubquery { sql: String, alias: String },
    Subquery {
        query: Box<SelectQuery>,
        alias: String,
    },
}

impl Default for FromItem {
    fn default() -> Self {
        FromItem::Table {
            schema: None,
            name: String::new(),
            alias: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJoinType {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: SqlJoinType,
    pub source: FromItem,
    pub on: Vec<SqlExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: SqlExpr,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub distinct: bool,
    pub select: Vec<SelectItem>,
    pub from: FromItem,
    pub joins: Vec<Join>,
    pub filters: Vec<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Vec<SqlExpr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
}

/// Renders the AST one clause per line. Identical input renders identically.
pub struct SqlRenderer<'d> {
    dialect: &'d dyn DialectAdapter,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn DialectAdapter) -> Self {
        Self { dialect }
    }

    pub fn render_select(&self, query: &SelectQuery) -> String {
        let select_items: Vec<String> = query
            .select
            .iter()
            .map(|item| {
                let expr_sql = self.render_expr(&item.expr);
                match &item.alias {
                    Some(alias) => format!("{expr_sql} AS {}", self.dialect.quote_ident(alias)),
                    None => expr_sql,
                }
            })
            .collect();

        let mut sql = format!(
            "SELECT {}{}\nFROM {}",
            if query.distinct { "DISTINCT " } else { "" },
            select_items.join(", "),
            self.render_from(&query.from)
        );

        for join in &query.joins {
            let join_kw = match join.join_type {
                SqlJoinType::Inner => "JOIN",
                SqlJoinType::Left => "LEFT JOIN",
            };
            let on_clause: Vec<String> = join.on.iter().map(|e| self.render_expr(e)).collect();
            sql.push_str(&format!(
                "\n{join_kw} {} ON {}",
                self.render_from(&join.source),
                on_clause.join(" AND ")
            ));
        }

        if !query.filters.is_empty() {
            let filters: Vec<String> = query.filters.iter().map(|f| self.render_expr(f)).collect();
            sql.push_str(&format!("\nWHERE {}", filters.join(" AND ")));
        }

        if !query.group_by.is_empty() {
            let groups: Vec<String> = query.group_by.iter().map(|g| self.render_expr(g)).collect();
            sql.push_str(&format!("\nGROUP BY {}", groups.join(", ")));
        }

        if !query.having.is_empty() {
            let having: Vec<String> = query.having.iter().map(|h| self.render_expr(h)).collect();
            sql.push_str(&format!("\nHAVING {}", having.join(" AND ")));
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| {
                    let expr = self.render_expr(&o.expr);
                    let dir = match o.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    format!("{expr} {dir}")
                })
                .collect();
            sql.push_str(&format!("\nORDER BY {}", orders.join(", ")));
        }

        if let Some(limit) = query.limit {
            sql.push_str(&format!("\nLIMIT {limit}"));
        }

        sql
    }

    fn render_from(&self, from: &FromItem) -> String {
        match from {
            FromItem::Table {
                schema,
                name,
                alias,
            } => {
                let table = self.dialect.qualify_table(name, schema.as_deref());
                match alias {
                    Some(alias) => format!("{table} AS {}", self.dialect.quote_ident(alias)),
                    None => table,
                }
            }
            FromItem::RawSubquery { sql, alias } => {
                format!("({}) AS {}", sql.trim(), self.dialect.quote_ident(alias))
            }
            FromItem::Subquery { query, alias } => format!(
                "({}) AS {}",
                self.render_select(query),
                self.dialect.quote_ident(alias)
            ),
        }
    }

    pub fn render_expr(&self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Column { table, name } => match table {
                Some(t) => format!(
                    "{}.{}",
                    self.dialect.quote_ident(t),
                    self.dialect.quote_ident(name)
                ),
                None => self.dialect.quote_ident(name),
            },
            SqlExpr::Raw(sql) => sql.clone(),
            SqlExpr::Literal(v) => self.dialect.render_literal(v),
            SqlExpr::Aggregate { agg, expr } => self
                .dialect
                .render_aggregation(*agg, &self.render_expr(expr)),
            SqlExpr::BinaryOp { op, left, right } => {
                let op_sql = match op {
                    SqlBinaryOperator::Eq => "=",
                    SqlBinaryOperator::Neq => "!=",
                    SqlBinaryOperator::Gt => ">",
                    SqlBinaryOperator::Gte => ">=",
                    SqlBinaryOperator::Lt => "<",
                    SqlBinaryOperator::Lte => "<=",
                    SqlBinaryOperator::Like => "LIKE",
                };
                format!(
                    "{} {} {}",
                    self.render_expr(left),
                    op_sql,
                    self.render_expr(right)
                )
            }
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                let rendered_values: Vec<String> =
                    list.iter().map(|v| self.render_expr(v)).collect();
                let not_kw = if *negated { "NOT " } else { "" };
                format!(
                    "{} {}IN ({})",
                    self.render_expr(expr),
                    not_kw,
                    rendered_values.join(", ")
                )
            }
            SqlExpr::IsNull { expr, negated } => {
                let not_kw = if *negated { "NOT " } else { "" };
                format!("{} IS {not_kw}NULL", self.render_expr(expr))
            }
            SqlExpr::Not(inner) => format!("NOT ({})", self.render_expr(inner)),
            SqlExpr::And(parts) => self.render_joined(parts, " AND "),
            SqlExpr::Or(parts) => self.render_joined(parts, " OR "),
        }
    }

    fn render_joined(&self, parts: &[SqlExpr], sep: &str) -> String {
        let rendered: Vec<String> = parts.iter().map(|p| self.render_expr(p)).collect();
        format!("({})", rendered.join(sep))
    }
}
