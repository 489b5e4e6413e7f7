//! Standard tools dispatched against a provisioned sandbox.

use serde_json::json;
use std::fs;

use etldebug_pipeline::{load_pipeline, SandboxDb};
use etldebug_tools::{ToolContext, ToolInvocationRequest, ToolRegistry};

struct Fixture {
    _case: tempfile::TempDir,
    _db: SandboxDb,
    ctx: ToolContext,
    registry: ToolRegistry,
}

fn fixture() -> Fixture {
    let case = tempfile::tempdir().expect("tempdir");
    let dir = case.path();
    fs::write(
        dir.join("pipeline.yaml"),
        "name: orders_load\nsource:\n  type: csv\n  tables: [orders, customers]\ndestination:\n  engine: sqlite\n  table: fact_orders\ntransform:\n  sql: |\n    INSERT INTO fact_orders SELECT o.order_id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id\n",
    )
    .expect("pipeline");
    fs::write(dir.join("orders.csv"), "order_id,customer_id,amount\n1,101,9.5\n2,102,N/A\n")
        .expect("orders");
    fs::write(dir.join("customers.csv"), "id,name\nCUST-101,Ann\nCUST-102,Bo\n").expect("customers");
    fs::write(
        dir.join("schema.sql"),
        "CREATE TABLE fact_orders (order_id INTEGER NOT NULL, customer_name TEXT, amount REAL);",
    )
    .expect("schema");
    let log = "INFO start\nWARN 0 rows joined\nERROR fact_orders is empty\n";
    fs::write(dir.join("error.log"), log).expect("log");

    let pipeline = load_pipeline(dir.join("pipeline.yaml")).expect("load");
    let db = SandboxDb::provision(&pipeline, dir).expect("provision");
    let ctx = ToolContext::new(&db, dir, log);
    Fixture {
        _case: case,
        _db: db,
        ctx,
        registry: ToolRegistry::standard(),
    }
}

fn call(f: &Fixture, tool: &str, args: serde_json::Value) -> etldebug_tools::ToolObservation {
    f.registry
        .dispatch(&ToolInvocationRequest::new(tool, args), &f.ctx)
}

#[test]
fn execute_sql_renders_a_table() {
    let f = fixture();
    let obs = call(&f, "execute_sql", json!({"query": "SELECT id, name FROM customers ORDER BY id"}));
    assert!(obs.success, "{}", obs.payload);
    assert!(obs.payload.starts_with("id       | name"), "{}", obs.payload);
    assert!(obs.payload.contains("CUST-101 | Ann"));
}

#[test]
fn execute_sql_errors_are_observations() {
    let f = fixture();
    let obs = call(&f, "execute_sql", json!({"query": "SELEC nonsense"}));
    assert!(!obs.success);
    assert!(obs.payload.starts_with("Error: SQL error"), "{}", obs.payload);
}

#[test]
fn execute_sql_rejects_other_engines() {
    let f = fixture();
    let obs = call(&f, "execute_sql", json!({"query": "SELECT 1", "engine": "duckdb"}));
    assert!(!obs.success);
    assert!(obs.payload.contains("engine `duckdb` is not available"), "{}", obs.payload);
}

#[test]
fn inspect_schema_reports_columns_and_count() {
    let f = fixture();
    let obs = call(&f, "inspect_schema", json!({"table_name": "orders"}));
    assert!(obs.success);
    assert!(obs.payload.starts_with("Table: orders\nRow count: 2"), "{}", obs.payload);
    assert!(obs.payload.contains("customer_id"));

    let obs = call(&f, "inspect_schema", json!({"table_name": "fact_order"}));
    assert!(!obs.success);
    assert!(obs.payload.contains("Available tables: customers, fact_orders, orders"), "{}", obs.payload);
}

#[test]
fn compare_schemas_flags_differences() {
    let f = fixture();
    let obs = call(
        &f,
        "compare_schemas",
        json!({"source_table": "orders", "dest_table": "fact_orders"}),
    );
    assert!(obs.success, "{}", obs.payload);
    assert!(obs.payload.contains("ONLY IN SOURCE"));
    assert!(obs.payload.contains("ONLY IN DEST"));
    assert!(obs.payload.contains("TYPE MISMATCH"));
}

#[test]
fn sample_values_shows_key_formats() {
    let f = fixture();
    let obs = call(
        &f,
        "sample_values",
        json!({"table_name": "customers", "column": "ID", "limit": 1}),
    );
    assert!(obs.success, "{}", obs.payload);
    assert!(obs.payload.starts_with("customers.id: 1 of 2 distinct"), "{}", obs.payload);
    assert!(obs.payload.contains("'CUST-101' (text)"));

    let obs = call(&f, "sample_values", json!({"table_name": "customers", "column": "nope"}));
    assert!(!obs.success);
    assert!(obs.payload.contains("Columns: id, name"));
}

#[test]
fn parse_logs_defaults_to_session_log() {
    let f = fixture();
    let obs = call(&f, "parse_logs", json!({}));
    assert!(obs.success);
    assert_eq!(obs.payload, "WARN 0 rows joined\nERROR fact_orders is empty");

    let obs = call(&f, "parse_logs", json!({"pattern": "["}));
    assert!(!obs.success);
}

#[test]
fn read_file_is_confined_to_case_directory() {
    let f = fixture();
    let obs = call(&f, "read_file", json!({"file_path": "schema.sql"}));
    assert!(obs.success);
    assert!(obs.payload.contains("CREATE TABLE fact_orders"));

    let obs = call(&f, "read_file", json!({"file_path": "/etc/passwd"}));
    assert!(!obs.success);
}

#[test]
fn tools_do_not_leak_state_between_calls() {
    let f = fixture();
    let obs = call(&f, "execute_sql", json!({"query": "DELETE FROM orders"}));
    assert_eq!(obs.payload, "Query executed successfully. Rows affected: 2");
    let obs = call(&f, "inspect_schema", json!({"table_name": "orders"}));
    assert!(obs.payload.contains("Row count: 0"));
}
