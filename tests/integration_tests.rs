//! End-to-end tests over the golden set
//!
//! These tests drive the whole workspace:
//! - golden-set loading → sandbox provisioning → precomputed diagnostics
//! - diagnosis loop in structured and native tool modes
//! - scoring and report aggregation
//!
//! Run with: cargo test --test integration_tests

use std::path::PathBuf;

use etldebug_agent::{
    precompute, AgentConfig, ChatBackend, ChatReply, ChatRequest, Diagnosis, DiagnosisStatus,
    GatewayError, Role, ScriptedBackend, ToolMode,
};
use etldebug_eval::{score_fix, EvalOptions, EvalRunner};
use etldebug_pipeline::{EvalCase, GoldenSet, SandboxDb};
use etldebug_tools::{ToolCatalogue, ToolContext, ToolInvocationRequest};
use serde_json::json;

fn golden_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("golden_set")
}

// ============================================================================
// A backend that knows the golden answers
// ============================================================================

struct Script {
    first_call: ToolInvocationRequest,
    answer: &'static str,
}

fn script_for(pipeline_name: &str) -> Option<Script> {
    let (tool, args, answer) = match pipeline_name {
        "daily_sales_load" => (
            "compare_schemas",
            json!({"source_table": "stg_sales", "dest_table": "fact_sales"}),
            "ROOT_CAUSE: Column name mismatch - 'total_amount' vs 'amount' in stg_sales\nFIX_TYPE: sql_modification\nFIX_DESCRIPTION: Read amount from staging.\nFIXED_SQL:\n```sql\nINSERT INTO fact_sales (sale_id, sale_date, total_amount)\nSELECT sale_id, sale_date, amount FROM stg_sales;\n```\nVERIFICATION_QUERY:\n```sql\nSELECT COUNT(*) FROM fact_sales;\n```",
        ),
        "customer_dimension_load" => (
            "inspect_schema",
            json!({"table_name": "dim_customers"}),
            "ROOT_CAUSE: dim_customers is missing the region column; the transform inserts region but the destination table does not have it\nFIX_TYPE: schema_change\nFIX_DESCRIPTION: Add the column and reload.\nFIXED_SQL:\n```sql\nALTER TABLE dim_customers ADD COLUMN region TEXT;\nINSERT INTO dim_customers (customer_id, name, email, region)\nSELECT customer_id, name, email, region FROM customers;\n```\nVERIFICATION_QUERY:\n```sql\nSELECT customer_id, region FROM dim_customers ORDER BY customer_id;\n```",
        ),
        "order_facts_load" => (
            "sample_values",
            json!({"table_name": "raw_orders", "column": "amount"}),
            "ROOT_CAUSE: Type mismatch: the amount column in raw_orders contains non-numeric text such as $45.00 and N/A, which cannot be cast to REAL\nFIX_TYPE: sql_modification\nFIX_DESCRIPTION: Clean and cast the amounts.\nFIXED_SQL:\n```sql\nINSERT INTO fact_orders (order_id, customer_id, amount)\nSELECT order_id, customer_id, CAST(REPLACE(amount, '$', '') AS REAL)\nFROM raw_orders\nWHERE amount <> 'N/A';\n```\nVERIFICATION_QUERY:\n```sql\nSELECT order_id, amount FROM fact_orders ORDER BY order_id;\n```",
        ),
        "enriched_orders_load" => (
            "execute_sql",
            json!({"query": "SELECT DISTINCT customer_id FROM orders"}),
            "ROOT_CAUSE: Join key format mismatch: orders.customer_id is numeric (101) but customers.id is prefixed (CUST-101), so the join matches no rows\nFIX_TYPE: sql_modification\nFIX_DESCRIPTION: Prefix the order side of the key.\nFIXED_SQL:\n```sql\nINSERT INTO fact_orders (order_id, customer_name, amount)\nSELECT o.order_id, c.name, o.amount\nFROM orders o\nJOIN customers c ON 'CUST-' || o.customer_id = c.id;\n```\nVERIFICATION_QUERY:\n```sql\nSELECT COUNT(*) FROM fact_orders;\n```",
        ),
        "event_facts_load" => (
            "sample_values",
            json!({"table_name": "events", "column": "event_date", "engine": "duckdb"}),
            "ROOT_CAUSE: Date format mismatch: events.event_date stores MM/DD/YYYY strings (01/15/2024) that cannot be cast to DATE without strptime\nFIX_TYPE: sql_modification\nFIX_DESCRIPTION: Parse the dates explicitly.\nFIXED_SQL:\n```sql\nINSERT INTO fact_events (event_id, event_date, event_type)\nSELECT CAST(event_id AS INTEGER), CAST(strptime(event_date, '%m/%d/%Y') AS DATE), event_type\nFROM events;\n```\nVERIFICATION_QUERY:\n```sql\nSELECT COUNT(*) FROM fact_events;\n```",
        ),
        _ => return None,
    };
    Some(Script {
        first_call: ToolInvocationRequest::new(tool, args),
        answer,
    })
}

/// Inspects once, then answers. Picks the case from the pipeline name in the
/// first user turn.
struct GoldenBackend {
    native: bool,
}

impl ChatBackend for GoldenBackend {
    fn name(&self) -> &'static str {
        "golden"
    }

    fn model(&self) -> &str {
        "golden-answers"
    }

    fn chat(&self, request: &ChatRequest) -> Result<ChatReply, GatewayError> {
        let first_user = request
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let name = first_user
            .lines()
            .find_map(|l| l.strip_prefix("Name: "))
            .unwrap_or_default();
        let Some(script) = script_for(name.trim()) else {
            return Ok(ChatReply::text("I do not recognise this pipeline."));
        };

        let turn = request.messages.iter().filter(|m| m.role == Role::Assistant).count();
        if turn > 0 {
            return Ok(ChatReply::text(script.answer));
        }
        if self.native {
            assert!(request.tools.is_some(), "native requests carry the catalogue");
            Ok(ChatReply {
                content: String::new(),
                tool_calls: vec![script.first_call],
            })
        } else {
            assert!(request.tools.is_none(), "structured requests carry no tools");
            let call = json!({"tool": script.first_call.tool, "args": script.first_call.args});
            Ok(ChatReply::text(format!("Let me look first.\nTOOL_CALL: {call}")))
        }
    }

    fn supports_native_tools(&self, _catalogue: &ToolCatalogue) -> Result<bool, GatewayError> {
        Ok(self.native)
    }

    fn ping(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

// ============================================================================
// Full evaluation runs
// ============================================================================

#[test]
fn golden_set_passes_in_structured_mode() {
    let backend = GoldenBackend { native: false };
    let report = EvalRunner::from_dir(&backend, golden_dir(), EvalOptions::default())
        .expect("golden set")
        .run()
        .expect("report");

    assert_eq!(report.results.len(), 5);
    for r in &report.results {
        assert!(r.error.is_none(), "{}: {:?}", r.case_id, r.error);
        assert!(r.root_cause_match, "{}: ratio {} missing {:?}", r.case_id, r.root_cause_ratio, r.missing_terms);
        assert!(r.fix_valid, "{}: {}", r.case_id, r.fix_detail);
        assert_eq!(r.steps_taken, 2);
        assert_eq!(r.tool_mode, Some(ToolMode::Structured));
    }
    assert_eq!(report.summary.diagnosis_accuracy, 1.0);
    assert_eq!(report.summary.fix_accuracy, 1.0);
    assert!((report.summary.mean_steps - 2.0).abs() < 1e-9);
}

#[test]
fn golden_set_passes_in_native_mode_with_parallel_jobs() {
    let backend = GoldenBackend { native: true };
    let options = EvalOptions {
        jobs: 4,
        ..EvalOptions::default()
    };
    let report = EvalRunner::from_dir(&backend, golden_dir(), options)
        .expect("golden set")
        .run()
        .expect("report");

    let ids: Vec<&str> = report.results.iter().map(|r| r.case_id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "case_01_schema_mismatch",
            "case_02_missing_column",
            "case_03_type_mismatch",
            "case_04_join_key_format",
            "case_05_date_format"
        ]
    );
    assert!(report.results.iter().all(|r| r.tool_mode == Some(ToolMode::Native)));
    assert_eq!(report.tool_mode, "native");
    assert_eq!(report.tool_mode_setting, "auto");
    assert_eq!(report.summary.fix_passed, 5);
}

#[test]
fn step_ceiling_still_yields_a_full_report() {
    let backend = ScriptedBackend::from_texts([
        "TOOL_CALL: {\"tool\": \"parse_logs\", \"args\": {\"pattern\": \"error\"}}",
    ]);
    let mut options = EvalOptions::default();
    options.agent = AgentConfig {
        max_steps: 1,
        ..options.agent
    };
    let report = EvalRunner::from_dir(&backend, golden_dir(), options)
        .expect("golden set")
        .run()
        .expect("report");

    assert_eq!(report.results.len(), 5);
    for r in &report.results {
        assert!(r.error.is_none());
        assert_eq!(r.status, Some(DiagnosisStatus::MaxStepsReached));
        assert_eq!(r.steps_taken, 1);
        assert!(!r.predicted_root_cause.is_empty());
        assert!(!r.fix_valid);
    }
    assert_eq!(report.summary.fix_accuracy, 0.0);
}

// ============================================================================
// Fixture sanity
// ============================================================================

#[test]
fn expected_fixes_are_valid_for_every_case() {
    let golden = GoldenSet::load(golden_dir()).expect("golden set");
    for entry in &golden.cases {
        let case = EvalCase::load(&golden, entry).expect("case");
        let pristine = SandboxDb::provision(&case.pipeline, &case.dir).expect("provision");
        let diagnosis = Diagnosis::from_answer(
            etldebug_agent::FinalAnswer {
                root_cause: case.expected.root_cause.clone(),
                fixed_sql: Some(case.expected.fixed_sql.clone()),
                ..Default::default()
            },
            "",
            1,
        );
        let score = score_fix(&pristine, &diagnosis, &case.expected);
        assert!(score.passed, "{}: {}", case.id, score.detail);
    }
}

fn score_sql(case_id: &str, sql: &str) -> etldebug_eval::FixScore {
    let golden = GoldenSet::load(golden_dir()).expect("golden set");
    let entry = golden
        .cases
        .iter()
        .find(|e| e.id == case_id)
        .expect("case in manifest");
    let case = EvalCase::load(&golden, entry).expect("case");
    let pristine = SandboxDb::provision(&case.pipeline, &case.dir).expect("provision");
    let diagnosis = Diagnosis::from_answer(
        etldebug_agent::FinalAnswer {
            root_cause: case.expected.root_cause.clone(),
            fixed_sql: Some(sql.to_string()),
            ..Default::default()
        },
        "",
        1,
    );
    score_fix(&pristine, &diagnosis, &case.expected)
}

#[test]
fn differently_written_fixes_both_pass() {
    // Verification compares outcomes, not SQL text.
    let variants = [
        (
            "case_01_schema_mismatch",
            "INSERT INTO fact_sales (sale_id, sale_date, total_amount) SELECT sale_id, sale_date, amount FROM stg_sales;",
            "WITH cleaned AS (SELECT CAST(sale_id AS INTEGER) AS id, sale_date AS d, CAST(amount AS REAL) AS amt FROM stg_sales)\nINSERT INTO fact_sales (total_amount, sale_date, sale_id) SELECT amt, d, id FROM cleaned ORDER BY id DESC;",
        ),
        (
            "case_04_join_key_format",
            "INSERT INTO fact_orders (order_id, customer_name, amount) SELECT o.order_id, c.name, o.amount FROM orders o JOIN customers c ON 'CUST-' || o.customer_id = c.id;",
            "INSERT INTO fact_orders (order_id, customer_name, amount)\nSELECT o.order_id, c.name, o.amount\nFROM customers c, orders o\nWHERE CAST(SUBSTR(c.id, 6) AS INTEGER) = CAST(o.customer_id AS INTEGER);",
        ),
    ];
    for (case_id, first, second) in variants {
        assert_ne!(first, second);
        for sql in [first, second] {
            let score = score_sql(case_id, sql);
            assert!(score.passed, "{case_id}: {}\n{sql}", score.detail);
        }
    }
}

#[test]
fn the_original_transform_does_not_pass_verification() {
    let golden = GoldenSet::load(golden_dir()).expect("golden set");
    for entry in &golden.cases {
        let case = EvalCase::load(&golden, entry).expect("case");
        let pristine = SandboxDb::provision(&case.pipeline, &case.dir).expect("provision");
        let diagnosis = Diagnosis::from_answer(
            etldebug_agent::FinalAnswer {
                root_cause: "unchanged".into(),
                fixed_sql: Some(case.pipeline.transform.sql.clone()),
                ..Default::default()
            },
            "",
            1,
        );
        let score = score_fix(&pristine, &diagnosis, &case.expected);
        assert!(!score.passed, "{} should still be broken: {}", case.id, score.detail);
    }
}

#[test]
fn precompute_flags_the_join_key_drift() {
    let golden = GoldenSet::load(golden_dir()).expect("golden set");
    let entry = golden
        .cases
        .iter()
        .find(|c| c.id == "case_04_join_key_format")
        .expect("case 4");
    let case = EvalCase::load(&golden, entry).expect("case");
    let db = SandboxDb::provision(&case.pipeline, &case.dir).expect("provision");
    let ctx = ToolContext::new(&db, &case.dir, case.error_log.as_str());

    let text = precompute(&case.pipeline, &ctx).render();
    assert!(text.contains("### Join key orders.customer_id = customers.id"), "{text}");
    assert!(text.contains("customers.id: 'CUST-101', 'CUST-102' (2 distinct)"), "{text}");
    assert!(text.contains("Values present on both sides: 0"));
}

#[test]
fn precompute_flags_non_numeric_amounts() {
    let golden = GoldenSet::load(golden_dir()).expect("golden set");
    let entry = golden
        .cases
        .iter()
        .find(|c| c.id == "case_03_type_mismatch")
        .expect("case 3");
    let case = EvalCase::load(&golden, entry).expect("case");
    let db = SandboxDb::provision(&case.pipeline, &case.dir).expect("provision");
    let ctx = ToolContext::new(&db, &case.dir, case.error_log.as_str());

    let text = precompute(&case.pipeline, &ctx).render();
    assert!(
        text.contains("raw_orders.amount -> fact_orders.amount (REAL): '$45.00', 'N/A'"),
        "{text}"
    );
}
