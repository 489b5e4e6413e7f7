//! Applying a proposed fix to a sandbox and verifying it.
//!
//! There is no rollback: callers apply fixes to a disposable copy
//! ([`SandboxDb::fork`]) and throw it away afterwards.

use serde::Serialize;

use etldebug_pipeline::SandboxDb;

use crate::sql::{query_result_set, run_statements, ResultSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FixOutcome {
    /// The fix applied and the verification query returned rows.
    Verified { result: ResultSet },
    /// The fix applied but could not be confirmed.
    Unverified { reason: String },
    /// The fix itself failed to execute.
    Failed { error: String },
}

impl FixOutcome {
    pub fn applied(&self) -> bool {
        !matches!(self, FixOutcome::Failed { .. })
    }
}

/// Execute `fix_sql` against `db`, then immediately run `verification_query`.
pub fn apply_fix(db: &SandboxDb, fix_sql: &str, verification_query: Option<&str>) -> FixOutcome {
    let conn = match db.connect() {
        Ok(conn) => conn,
        Err(err) => {
            return FixOutcome::Failed {
                error: err.to_string(),
            }
        }
    };

    if let Err(err) = run_statements(&conn, fix_sql, Some(0)) {
        tracing::info!(error = %err, "fix failed to apply");
        return FixOutcome::Failed {
            error: err.to_string(),
        };
    }

    let Some(query) = verification_query.map(str::trim).filter(|q| !q.is_empty()) else {
        return FixOutcome::Unverified {
            reason: "no verification query was provided".to_string(),
        };
    };

    match query_result_set(&conn, query) {
        Ok(result) if result.rows.is_empty() => FixOutcome::Unverified {
            reason: "verification query returned no rows".to_string(),
        },
        Ok(result) => FixOutcome::Verified { result },
        Err(err) => FixOutcome::Unverified {
            reason: format!("verification query failed: {err}"),
        },
    }
}
