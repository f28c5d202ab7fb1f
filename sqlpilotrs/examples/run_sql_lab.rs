use std::{path::Path, sync::Arc};

use sqlpilot::{
    backends::{ConnectionManager, DuckDbConnection},
    sql_lab::InMemoryQueryStore,
    telemetry, SqlLab, SqlLabRequest, User,
};

fn bootstrap_duckdb(path: &Path) -> anyhow::Result<()> {
    let conn = duckdb::Connection::open(path)?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY,
            region VARCHAR,
            amount DOUBLE,
            created_at TIMESTAMP
        );
        DELETE FROM orders;
        INSERT INTO orders VALUES
            (1, 'US', 100.0, '2023-01-01'),
            (2, 'UK', 50.0, '2023-01-02'),
            (3, 'US', 25.0, '2023-01-03');
        ",
    )?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info");

    let db_path = std::env::temp_dir().join("sqlpilot_demo.duckdb");
    bootstrap_duckdb(&db_path)?;

    let mut connections = ConnectionManager::new();
    connections.insert("demo", Arc::new(DuckDbConnection::new(&db_path)));
    let lab = SqlLab::from_config(Arc::new(connections), Arc::new(InMemoryQueryStore::new()));
    let user = User::new(1, "demo");

    let sync = lab
        .submit(
            SqlLabRequest::new(
                "demo",
                "SELECT region, SUM(amount) AS revenue FROM orders GROUP BY region ORDER BY region",
            ),
            &user,
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&sync)?);

    let submitted = lab
        .submit(
            SqlLabRequest::new("demo", "SELECT COUNT(*) AS n FROM orders").run_async(true),
            &user,
        )
        .await?;
    let query_id = submitted.query_id;
    loop {
        let payload = lab.status(query_id).await?;
        if payload.status.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&payload)?);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    Ok(())
}
