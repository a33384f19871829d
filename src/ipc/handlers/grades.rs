use super::plans::{db_err, now_rfc3339, read_plan, HandlerErr};
use crate::calc::{self, ActivityGrade};
use crate::elect;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct RecordHead {
    student_id: String,
    plan_id: String,
    semester: String,
    target_grade: Option<f64>,
    status: String,
    created_at: String,
    updated_at: Option<String>,
}

fn load_record_head(conn: &Connection, record_id: &str) -> Result<Option<RecordHead>, HandlerErr> {
    conn.query_row(
        "SELECT student_id, plan_id, semester, target_grade, status, created_at, updated_at
         FROM grade_records
         WHERE id = ?",
        [record_id],
        |r| {
            Ok(RecordHead {
                student_id: r.get(0)?,
                plan_id: r.get(1)?,
                semester: r.get(2)?,
                target_grade: r.get(3)?,
                status: r.get(4)?,
                created_at: r.get(5)?,
                updated_at: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

struct ActivityRow {
    row_id: String,
    grade: ActivityGrade,
    notes: Option<String>,
}

fn load_activities(conn: &Connection, record_id: &str) -> Result<Vec<ActivityRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, percentage, score, max_score, notes
             FROM grade_activities
             WHERE record_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    stmt.query_map([record_id], |r| {
        Ok(ActivityRow {
            row_id: r.get(0)?,
            grade: ActivityGrade {
                name: r.get(1)?,
                percentage: r.get(2)?,
                score: r.get(3)?,
                max_score: r.get(4)?,
            },
            notes: r.get(5)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

/// Recomputes every derived field from the full activity set and persists the
/// stored projections (status, final grade). `withdrawn` is sticky and never
/// overwritten here.
fn recompute_record(conn: &Connection, record_id: &str) -> Result<(), HandlerErr> {
    let Some(head) = load_record_head(conn, record_id)? else {
        return Err(HandlerErr::new("not_found", "grade record not found"));
    };
    let rows = load_activities(conn, record_id)?;
    let grades: Vec<ActivityGrade> = rows.iter().map(|r| r.grade.clone()).collect();
    let progress = calc::compute_progress(&grades, head.target_grade);

    let status = if head.status == "withdrawn" {
        "withdrawn"
    } else {
        calc::derived_status(&progress)
    };
    conn.execute(
        "UPDATE grade_records SET status = ?, final_grade = ?, updated_at = ? WHERE id = ?",
        (status, progress.final_grade, now_rfc3339(), record_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(())
}

fn read_record(conn: &Connection, record_id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    let Some(head) = load_record_head(conn, record_id)? else {
        return Ok(None);
    };
    let rows = load_activities(conn, record_id)?;
    let grades: Vec<ActivityGrade> = rows.iter().map(|r| r.grade.clone()).collect();
    let progress = calc::compute_progress(&grades, head.target_grade);

    let activities: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            json!({
                "name": r.grade.name,
                "percentage": r.grade.percentage,
                "score": r.grade.score,
                "maxScore": r.grade.max_score,
                "notes": r.notes,
            })
        })
        .collect();

    Ok(Some(json!({
        "recordId": record_id,
        "studentId": head.student_id,
        "planId": head.plan_id,
        "semester": head.semester,
        "targetGrade": head.target_grade,
        "status": head.status,
        "createdAt": head.created_at,
        "updatedAt": head.updated_at,
        "activities": activities,
        "progress": progress,
    })))
}

fn respond_with_record(conn: &Connection, req_id: &str, record_id: &str) -> serde_json::Value {
    match read_record(conn, record_id) {
        Ok(Some(r)) => ok(req_id, json!({ "record": r })),
        Ok(None) => err(req_id, "not_found", "grade record not found", None),
        Err(e) => e.response(req_id),
    }
}

fn handle_grades_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(plan_id) = req.params.get("planId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing planId", None);
    };
    let target_grade = req.params.get("targetGrade").and_then(|v| v.as_f64());
    if let Some(t) = target_grade {
        if let Err(e) = calc::check_target_grade(t) {
            return HandlerErr::from(e).response(&req.id);
        }
    }

    let plan: Option<(String, i64)> = match conn
        .query_row(
            "SELECT semester, is_approved FROM evaluation_plans WHERE id = ? AND is_active = 1",
            [plan_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((semester, is_approved)) = plan else {
        return err(&req.id, "not_found", "plan not found", None);
    };
    if is_approved == 0 {
        return err(&req.id, "validation_failed", "plan not approved", None);
    }

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM grade_records WHERE student_id = ? AND plan_id = ?",
            (student_id, plan_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(id) = existing {
        return err(
            &req.id,
            "duplicate",
            "grade record already exists for this student and plan",
            Some(json!({ "recordId": id })),
        );
    }

    let record_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO grade_records(id, student_id, plan_id, semester, target_grade, status, created_at)
         VALUES(?, ?, ?, ?, ?, 'in_progress', ?)",
        (&record_id, student_id, plan_id, &semester, target_grade, now_rfc3339()),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    // Seed the personal ledger with the plan's activities, unscored.
    if let Err(e) = tx.execute(
        "INSERT INTO grade_activities(id, record_id, sort_order, name, percentage, score, max_score)
         SELECT lower(hex(randomblob(16))), ?1, sort_order, name, percentage, NULL, ?2
         FROM plan_activities
         WHERE plan_id = ?3",
        (&record_id, calc::GRADE_SCALE_MAX, plan_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    // Saving a plan counts as adoption, which feeds the main-version ranking.
    if let Err(e) = elect::increment_usage(conn, plan_id) {
        return HandlerErr::from(e).response(&req.id);
    }

    respond_with_record(conn, &req.id, &record_id)
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(record_id) = req.params.get("recordId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing recordId", None);
    };
    respond_with_record(conn, &req.id, record_id)
}

fn handle_grades_find(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(plan_id) = req.params.get("planId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing planId", None);
    };

    let record_id: Option<String> = match conn
        .query_row(
            "SELECT id FROM grade_records WHERE student_id = ? AND plan_id = ?",
            (student_id, plan_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(record_id) = record_id else {
        return err(&req.id, "not_found", "grade record not found", None);
    };
    respond_with_record(conn, &req.id, &record_id)
}

fn handle_grades_list_by_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let semester = req.params.get("semester").and_then(|v| v.as_str());

    let result = match semester {
        Some(sem) => conn
            .prepare(
                "SELECT id FROM grade_records
                 WHERE student_id = ? AND semester = ?
                 ORDER BY created_at",
            )
            .and_then(|mut stmt| {
                stmt.query_map((student_id, sem), |r| r.get(0))
                    .and_then(|it| it.collect::<Result<Vec<String>, _>>())
            }),
        None => conn
            .prepare("SELECT id FROM grade_records WHERE student_id = ? ORDER BY created_at")
            .and_then(|mut stmt| {
                stmt.query_map([student_id], |r| r.get(0))
                    .and_then(|it| it.collect::<Result<Vec<String>, _>>())
            }),
    };
    let ids = match result {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut records = Vec::with_capacity(ids.len());
    for id in &ids {
        match read_record(conn, id) {
            Ok(Some(r)) => records.push(r),
            Ok(None) => {}
            Err(e) => return e.response(&req.id),
        }
    }
    ok(&req.id, json!({ "records": records }))
}

/// Resolves the activity slot a score mutation refers to, by name or by index.
fn resolve_activity(
    conn: &Connection,
    record_id: &str,
    params: &serde_json::Value,
) -> Result<Option<ActivityRow>, HandlerErr> {
    let rows = load_activities(conn, record_id)?;
    if let Some(name) = params.get("activityName").and_then(|v| v.as_str()) {
        return Ok(rows.into_iter().find(|r| r.grade.name == name));
    }
    if let Some(idx) = params.get("activityIndex").and_then(|v| v.as_i64()) {
        if idx < 0 {
            return Err(HandlerErr::new("bad_params", "activityIndex must be >= 0"));
        }
        return Ok(rows.into_iter().nth(idx as usize));
    }
    Err(HandlerErr::new(
        "bad_params",
        "missing activityName or activityIndex",
    ))
}

fn guard_mutable(head: &RecordHead) -> Result<(), HandlerErr> {
    if head.status == "withdrawn" {
        return Err(HandlerErr::new(
            "validation_failed",
            "grade record is withdrawn",
        ));
    }
    Ok(())
}

fn handle_grades_update_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(record_id) = req.params.get("recordId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing recordId", None);
    };
    let Some(score) = req.params.get("score").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing score", None);
    };
    let notes = req.params.get("notes").and_then(|v| v.as_str());

    let head = match load_record_head(conn, record_id) {
        Ok(Some(h)) => h,
        Ok(None) => return err(&req.id, "not_found", "grade record not found", None),
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = guard_mutable(&head) {
        return e.response(&req.id);
    }

    let existing = match resolve_activity(conn, record_id, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match existing {
        Some(row) => {
            let max_score = req
                .params
                .get("maxScore")
                .and_then(|v| v.as_f64())
                .unwrap_or(row.grade.max_score);
            if max_score <= 0.0 {
                return err(&req.id, "validation_failed", "maxScore must be positive", None);
            }
            if let Err(e) = calc::check_score(score, max_score) {
                return HandlerErr::from(e).response(&req.id);
            }
            let percentage = req
                .params
                .get("percentage")
                .and_then(|v| v.as_f64())
                .unwrap_or(row.grade.percentage);
            if let Err(e) = calc::check_activity(&row.grade.name, percentage, max_score) {
                return HandlerErr::from(e).response(&req.id);
            }
            if let Err(e) = conn.execute(
                "UPDATE grade_activities
                 SET score = ?, max_score = ?, percentage = ?,
                     notes = COALESCE(?, notes), updated_at = ?
                 WHERE id = ?",
                (score, max_score, percentage, notes, now_rfc3339(), &row.row_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
        None => {
            // A slot the plan does not know about: allowed only with an explicit
            // name and weight, appended after the seeded activities.
            let Some(name) = req.params.get("activityName").and_then(|v| v.as_str()) else {
                return err(&req.id, "not_found", "activity not found", None);
            };
            let Some(percentage) = req.params.get("percentage").and_then(|v| v.as_f64()) else {
                return err(
                    &req.id,
                    "bad_params",
                    "new activity requires a percentage",
                    None,
                );
            };
            let max_score = req
                .params
                .get("maxScore")
                .and_then(|v| v.as_f64())
                .unwrap_or(calc::GRADE_SCALE_MAX);
            if let Err(e) = calc::check_activity(name, percentage, max_score) {
                return HandlerErr::from(e).response(&req.id);
            }
            if let Err(e) = calc::check_score(score, max_score) {
                return HandlerErr::from(e).response(&req.id);
            }
            let next_sort: i64 = match conn.query_row(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM grade_activities WHERE record_id = ?",
                [record_id],
                |r| r.get(0),
            ) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if let Err(e) = conn.execute(
                "INSERT INTO grade_activities(id, record_id, sort_order, name, percentage, score, max_score, notes, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    record_id,
                    next_sort,
                    name.trim(),
                    percentage,
                    score,
                    max_score,
                    notes,
                    now_rfc3339(),
                ),
            ) {
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
    }

    if let Err(e) = recompute_record(conn, record_id) {
        return e.response(&req.id);
    }
    respond_with_record(conn, &req.id, record_id)
}

fn handle_grades_remove_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(record_id) = req.params.get("recordId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing recordId", None);
    };

    let head = match load_record_head(conn, record_id) {
        Ok(Some(h)) => h,
        Ok(None) => return err(&req.id, "not_found", "grade record not found", None),
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = guard_mutable(&head) {
        return e.response(&req.id);
    }

    let row = match resolve_activity(conn, record_id, &req.params) {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "not_found", "activity not found", None),
        Err(e) => return e.response(&req.id),
    };

    // The slot still belongs to the plan; only the score goes away.
    if let Err(e) = conn.execute(
        "UPDATE grade_activities SET score = NULL, updated_at = ? WHERE id = ?",
        (now_rfc3339(), &row.row_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    if let Err(e) = recompute_record(conn, record_id) {
        return e.response(&req.id);
    }
    respond_with_record(conn, &req.id, record_id)
}

fn handle_grades_set_target(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(record_id) = req.params.get("recordId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing recordId", None);
    };
    let Some(target) = req.params.get("targetGrade").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing targetGrade", None);
    };
    if let Err(e) = calc::check_target_grade(target) {
        return HandlerErr::from(e).response(&req.id);
    }

    let changed = match conn.execute(
        "UPDATE grade_records SET target_grade = ?, updated_at = ? WHERE id = ?",
        (target, now_rfc3339(), record_id),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "grade record not found", None);
    }

    if let Err(e) = recompute_record(conn, record_id) {
        return e.response(&req.id);
    }
    respond_with_record(conn, &req.id, record_id)
}

fn handle_grades_withdraw(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(record_id) = req.params.get("recordId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing recordId", None);
    };

    let changed = match conn.execute(
        "UPDATE grade_records SET status = 'withdrawn', updated_at = ? WHERE id = ?",
        (now_rfc3339(), record_id),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "grade record not found", None);
    }
    respond_with_record(conn, &req.id, record_id)
}

fn handle_grades_plan(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Convenience lookup: the plan backing a record, for display.
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(record_id) = req.params.get("recordId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing recordId", None);
    };
    let head = match load_record_head(conn, record_id) {
        Ok(Some(h)) => h,
        Ok(None) => return err(&req.id, "not_found", "grade record not found", None),
        Err(e) => return e.response(&req.id),
    };
    match read_plan(conn, &head.plan_id) {
        Ok(Some(p)) => ok(&req.id, json!({ "plan": p })),
        Ok(None) => err(&req.id, "not_found", "plan not found", None),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.create" => Some(handle_grades_create(state, req)),
        "grades.get" => Some(handle_grades_get(state, req)),
        "grades.find" => Some(handle_grades_find(state, req)),
        "grades.listByStudent" => Some(handle_grades_list_by_student(state, req)),
        "grades.updateScore" => Some(handle_grades_update_score(state, req)),
        "grades.removeScore" => Some(handle_grades_remove_score(state, req)),
        "grades.setTarget" => Some(handle_grades_set_target(state, req)),
        "grades.withdraw" => Some(handle_grades_withdraw(state, req)),
        "grades.plan" => Some(handle_grades_plan(state, req)),
        _ => None,
    }
}
