use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;

pub const MAIN_VERSION_NAME: &str = "Plan Principal";
pub const ALTERNATIVE_VERSION_NAME: &str = "Versión Alternativa";

#[derive(Debug, Clone, Serialize)]
pub struct ElectError {
    pub code: String,
    pub message: String,
}

impl ElectError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn db_err(e: rusqlite::Error) -> ElectError {
    ElectError::new("db_query_failed", e.to_string())
}

/// One active plan of a course offering, as seen by the ranking pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub plan_id: String,
    pub usage_count: i64,
    pub comment_count: i64,
    pub created_at: String,
    pub is_main_version: bool,
}

/// Election precedence: higher usage, then higher comments, then the oldest
/// plan (established schemes beat newcomers on a full tie). Equal timestamps
/// fall back to the plan id so the ordering is total.
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.usage_count
        .cmp(&a.usage_count)
        .then(b.comment_count.cmp(&a.comment_count))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.plan_id.cmp(&b.plan_id))
}

fn load_candidates(
    conn: &Connection,
    semester: &str,
    subject_code: &str,
    group_number: i64,
) -> Result<Vec<Candidate>, ElectError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, usage_count, comment_count, created_at, is_main_version
             FROM evaluation_plans
             WHERE semester = ? AND subject_code = ? AND group_number = ? AND is_active = 1",
        )
        .map_err(db_err)?;
    stmt.query_map((semester, subject_code, group_number), |r| {
        Ok(Candidate {
            plan_id: r.get(0)?,
            usage_count: r.get(1)?,
            comment_count: r.get(2)?,
            created_at: r.get(3)?,
            is_main_version: r.get::<_, i64>(4)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

/// Re-elects the canonical plan for one course offering and persists the
/// decision: every active sibling is demoted to "Versión Alternativa" and the
/// top-ranked candidate is flagged main as "Plan Principal". Returns the
/// winning plan id, or None when the key has no active plans.
///
/// Idempotent: unchanged counters reproduce the same winner and flags.
pub fn find_or_create_main_version(
    conn: &Connection,
    semester: &str,
    subject_code: &str,
    group_number: i64,
) -> Result<Option<String>, ElectError> {
    let mut candidates = load_candidates(conn, semester, subject_code, group_number)?;
    if candidates.is_empty() {
        return Ok(None);
    }

    let main_flagged = candidates.iter().filter(|c| c.is_main_version).count();
    if main_flagged > 1 {
        // Auto-corrected below; never surfaced to the caller.
        eprintln!(
            "evalpland: consistency warning: {} main-flagged plans for {}/{}/{}",
            main_flagged, semester, subject_code, group_number
        );
    }

    candidates.sort_by(compare_candidates);
    let winner = candidates[0].plan_id.clone();

    let tx = conn.unchecked_transaction().map_err(db_err)?;
    if let Err(e) = tx.execute(
        "UPDATE evaluation_plans
         SET is_main_version = 0, version_name = ?
         WHERE semester = ? AND subject_code = ? AND group_number = ? AND is_active = 1",
        (ALTERNATIVE_VERSION_NAME, semester, subject_code, group_number),
    ) {
        let _ = tx.rollback();
        return Err(ElectError::new("db_update_failed", e.to_string()));
    }
    if let Err(e) = tx.execute(
        "UPDATE evaluation_plans SET is_main_version = 1, version_name = ? WHERE id = ?",
        (MAIN_VERSION_NAME, &winner),
    ) {
        let _ = tx.rollback();
        return Err(ElectError::new("db_update_failed", e.to_string()));
    }
    tx.commit()
        .map_err(|e| ElectError::new("db_tx_failed", e.to_string()))?;

    Ok(Some(winner))
}

/// The two external mutation entry points into the ranking state. Each bumps
/// its counter and immediately re-runs the election for the plan's offering.
pub fn increment_usage(conn: &Connection, plan_id: &str) -> Result<(), ElectError> {
    increment_counter(conn, plan_id, "usage_count")
}

pub fn increment_comments(conn: &Connection, plan_id: &str) -> Result<(), ElectError> {
    increment_counter(conn, plan_id, "comment_count")
}

fn increment_counter(conn: &Connection, plan_id: &str, column: &str) -> Result<(), ElectError> {
    // Column name comes from the two callers above, never from input.
    let sql = format!(
        "UPDATE evaluation_plans
         SET {c} = {c} + 1, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ? AND is_active = 1",
        c = column
    );
    let changed = conn
        .execute(&sql, [plan_id])
        .map_err(|e| ElectError::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(ElectError::new("not_found", "plan not found"));
    }

    let key: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT semester, subject_code, group_number FROM evaluation_plans WHERE id = ?",
            [plan_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((semester, subject_code, group_number)) = key else {
        return Err(ElectError::new("not_found", "plan not found"));
    };

    find_or_create_main_version(conn, &semester, &subject_code, group_number)?;
    Ok(())
}
