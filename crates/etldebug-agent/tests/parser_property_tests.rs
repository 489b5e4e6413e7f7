//! Property tests for reply classification.
//!
//! Model output is untrusted: whatever arrives, classification and salvage
//! must return normally, and a salvaged answer is always degraded.

use etldebug_agent::fallback::salvage;
use etldebug_agent::{ModelResponse, ParsedResponse, ResponseParser, ToolMode};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// Pieces models actually emit, in any order and quantity.
fn fragment_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("TOOL_CALL:".to_string()),
        Just("TOOL_CALL: {\"tool\": \"execute_sql\", \"args\": {\"query\": \"SELECT 1\"}}".to_string()),
        Just("{\"tool_calls\": [{\"name\": \"inspect_schema\"".to_string()),
        Just("ROOT_CAUSE:".to_string()),
        Just("**FIXED_SQL:**".to_string()),
        Just("```sql".to_string()),
        Just("```".to_string()),
        Just("{".to_string()),
        Just("}".to_string()),
        Just("\"".to_string()),
        Just("\\".to_string()),
        Just("\n".to_string()),
        Just("INSERT INTO t SELECT * FROM s;".to_string()),
        Just("SELECT COUNT(*) FROM t;".to_string()),
        Just("The issue is a type mismatch.".to_string()),
        Just("é✓".to_string()),
        "[ -~]{0,20}",
    ]
}

fn reply_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(fragment_strategy(), 0..12).prop_map(|parts| parts.join(" "))
}

fn structured(text: String) -> ModelResponse {
    ModelResponse {
        mode: ToolMode::Structured,
        text,
        native_calls: Vec::new(),
    }
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn arbitrary_text_is_classified(text in any::<String>()) {
        let parser = ResponseParser::new();
        let _ = parser.parse(&structured(text.clone()));
        let _ = salvage(&text);
    }

    #[test]
    fn fragment_soup_is_classified(text in reply_strategy()) {
        let parser = ResponseParser::new();
        match parser.parse(&structured(text.clone())) {
            ParsedResponse::ToolCalls(calls) => prop_assert!(!calls.is_empty()),
            ParsedResponse::FinalAnswer(answer) => {
                prop_assert!(!answer.root_cause.trim().is_empty() || answer.fixed_sql.is_some());
            }
            ParsedResponse::Unparseable { raw } => prop_assert_eq!(raw, text.clone()),
        }
        if let Some(answer) = salvage(&text) {
            prop_assert!(answer.degraded);
        }
    }

    #[test]
    fn labelled_answers_survive_surrounding_noise(
        prefix in "[a-z ]{0,40}",
        cause in "[A-Za-z][a-z ]{5,40}",
    ) {
        let text = format!(
            "{prefix}\nROOT_CAUSE: {cause}\nFIX_TYPE: sql_modification\nFIXED_SQL:\nUPDATE t SET x = 1;\n"
        );
        match ResponseParser::new().parse(&structured(text)) {
            ParsedResponse::FinalAnswer(answer) => {
                prop_assert_eq!(answer.root_cause.trim(), cause.trim());
                prop_assert_eq!(answer.fixed_sql.as_deref(), Some("UPDATE t SET x = 1;"));
            }
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }
}
