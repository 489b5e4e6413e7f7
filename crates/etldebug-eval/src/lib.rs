//! Golden-set evaluation.
//!
//! - `scorer`: root-cause keyword overlap and fix validity for one case
//! - `runner`: the diagnosis loop over every selected case, isolated per case
//! - `report`: per-case results, aggregate metrics, table and JSON output

pub mod report;
pub mod runner;
pub mod scorer;

pub use report::{CaseResult, EvalReport, EvalSummary};
pub use runner::{EvalError, EvalOptions, EvalRunner};
pub use scorer::{
    compare_result, extract_terms, score_fix, score_root_cause, FixScore, RootCauseScore,
    PASS_THRESHOLD,
};
