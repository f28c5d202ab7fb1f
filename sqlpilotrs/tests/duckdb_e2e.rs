#![cfg(feature = "duckdb")]
//! End-to-end runs against a real DuckDB file.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use sqlpilot::authz::User;
use sqlpilot::backends::{ConnectionManager, DuckDbConnection};
use sqlpilot::config::TempTableConfig;
use sqlpilot::export::{CsvOptions, TempTableManager};
use sqlpilot::query_spec::QuerySpec;
use sqlpilot::sql_lab::{InMemoryQueryStore, QueryStatus, SqlLab, SqlLabRequest};
use sqlpilot::template::TemplateContext;
use sqlpilot::{load_and_validate, run_chart_query, Validator};

fn bootstrap_duckdb(db_path: &Path) -> anyhow::Result<()> {
    let conn = duckdb::Connection::open(db_path)?;
    conn.execute_batch(
        "
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            region VARCHAR,
            status VARCHAR,
            amount DOUBLE,
            created_at TIMESTAMP
        );
        INSERT INTO orders VALUES
            (1, 'US', 'paid', 100.0, '2023-01-01'),
            (2, 'UK', 'paid', 50.0, '2023-01-02'),
            (3, 'US', 'refunded', 25.0, '2023-01-03');
        ",
    )?;
    Ok(())
}

fn write_datasets(root: &Path) -> anyhow::Result<()> {
    let dir = root.join("datasets");
    fs::create_dir_all(&dir)?;
    let orders = r#"
name: orders
database: warehouse
table: orders
main_dttm_col: created_at
columns:
  - column_name: created_at
    type: TIMESTAMP
    is_dttm: true
  - column_name: region
    type: VARCHAR
  - column_name: status
    type: VARCHAR
  - column_name: amount
    type: DOUBLE
    sum: true
"#;
    fs::write(dir.join("orders.yaml"), orders)?;
    Ok(())
}

fn setup(dir: &Path) -> anyhow::Result<ConnectionManager> {
    let db_path = dir.join("demo.duckdb");
    bootstrap_duckdb(&db_path)?;
    write_datasets(dir)?;
    let mut connections = ConnectionManager::new();
    connections.insert(
        "warehouse",
        Arc::new(DuckDbConnection::new(&db_path).with_max_concurrency(4)),
    );
    Ok(connections)
}

#[tokio::test]
async fn chart_query_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let connections = setup(dir.path())?;
    let validator = Validator::new(connections.clone(), false);
    let registry = load_and_validate(dir.path(), &validator).await?;

    let spec: QuerySpec = serde_json::from_value(json!({
        "metrics": ["count", "sum__amount"],
        "groupby": ["region"],
        "filters": [{"col": "status", "op": "==", "val": "paid"}],
        "row_limit": 10
    }))?;
    let result = run_chart_query(
        &connections,
        &registry,
        "orders",
        &spec,
        TemplateContext::default(),
    )
    .await?;

    assert_eq!(result.status, QueryStatus::Success, "{:?}", result.error_message);
    assert_eq!(result.data.size, 2);
    let us = result
        .data
        .data
        .iter()
        .find(|row| row.get("region") == Some(&json!("US")))
        .expect("US row");
    assert_eq!(us.get("count"), Some(&json!(1)));
    assert_eq!(us.get("sum__amount").and_then(|v| v.as_f64()), Some(100.0));
    Ok(())
}

#[tokio::test]
async fn sql_lab_runs_and_materializes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let connections = Arc::new(setup(dir.path())?);
    let lab = SqlLab::from_config(connections.clone(), Arc::new(InMemoryQueryStore::new()));
    let user = User::new(1, "ana");

    let payload = lab
        .submit(
            SqlLabRequest::new("warehouse", "SELECT region, amount FROM orders ORDER BY id"),
            &user,
        )
        .await?;
    assert_eq!(payload.status, QueryStatus::Success, "{:?}", payload.error);
    assert_eq!(payload.data.len(), 3);
    assert_eq!(payload.data[1].get("region"), Some(&json!("UK")));

    let mut cta = SqlLabRequest::new("warehouse", "SELECT DISTINCT region FROM orders");
    cta.select_as_cta = true;
    cta.tmp_table_name = Some("regions".into());
    let payload = lab.submit(cta, &user).await?;
    assert_eq!(payload.status, QueryStatus::Success, "{:?}", payload.error);

    let preview = lab.preview("warehouse", "regions", None, 10, &user).await?;
    assert_eq!(preview.size, 2);
    Ok(())
}

#[tokio::test]
async fn export_through_temp_table() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let connections = setup(dir.path())?;
    let conn = connections.require("warehouse")?;
    let dialect = connections.dialect_for("warehouse")?;
    let manager = TempTableManager::new(TempTableConfig {
        schema: "scratch".into(),
        ..TempTableConfig::default()
    });

    let csv = manager
        .export_via_temp_table(
            conn.as_ref(),
            dialect.as_ref(),
            "ana",
            "SELECT region, amount FROM orders WHERE status = 'paid' ORDER BY id",
            CsvOptions::default(),
        )
        .await?;

    assert_eq!(String::from_utf8(csv)?, "region,amount\nUS,100.0\nUK,50.0\n");
    assert!(manager.tables_for("ana").is_empty());
    Ok(())
}
