use crate::calc;
use crate::elect;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

pub(super) struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<calc::CalcError> for HandlerErr {
    fn from(e: calc::CalcError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

impl From<elect::ElectError> for HandlerErr {
    fn from(e: elect::ElectError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: None,
        }
    }
}

pub(super) fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub(super) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityInput {
    name: String,
    percentage: f64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    due_date: Option<String>,
}

/// Course-offering key shared by most plan methods.
pub(super) struct OfferingKey {
    pub semester: String,
    pub subject_code: String,
    pub group_number: i64,
}

pub(super) fn parse_offering_key(params: &serde_json::Value) -> Result<OfferingKey, HandlerErr> {
    let semester = params
        .get("semester")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing semester"))?;
    let subject_code = params
        .get("subjectCode")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing subjectCode"))?;
    let group_number = params
        .get("groupNumber")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing groupNumber"))?;
    Ok(OfferingKey {
        semester: semester.to_string(),
        subject_code: subject_code.to_string(),
        group_number,
    })
}

fn parse_activities(params: &serde_json::Value) -> Result<Vec<ActivityInput>, HandlerErr> {
    let Some(raw) = params.get("activities") else {
        return Err(HandlerErr::new("bad_params", "missing activities"));
    };
    let activities: Vec<ActivityInput> = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::new("bad_params", format!("bad activities: {}", e)))?;
    if activities.is_empty() {
        return Err(HandlerErr::new(
            "validation_failed",
            "a plan needs at least one activity",
        ));
    }
    for a in &activities {
        calc::check_activity(&a.name, a.percentage, calc::GRADE_SCALE_MAX)?;
    }
    let percentages: Vec<f64> = activities.iter().map(|a| a.percentage).collect();
    calc::check_percentage_sum(&percentages)?;
    Ok(activities)
}

/// Leading year token of the semester label ("2025-2" -> "2025").
fn academic_year_from(semester: &str) -> Option<String> {
    let digits: String = semester
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.len() >= 4 {
        Some(digits[..4].to_string())
    } else {
        None
    }
}

fn generate_version_id(key: &OfferingKey) -> String {
    let rand = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}_{}",
        key.subject_code,
        key.semester,
        key.group_number,
        Utc::now().timestamp_millis(),
        &rand[..8]
    )
}

struct NewPlan {
    key: OfferingKey,
    professor_id: String,
    created_by: Option<String>,
    version_id: Option<String>,
    version_name: String,
    parent_plan_id: Option<String>,
    is_approved: bool,
    activities: Vec<ActivityInput>,
}

fn insert_plan(conn: &Connection, plan: NewPlan) -> Result<String, HandlerErr> {
    let version_id = match plan.version_id {
        Some(v) => v,
        None => generate_version_id(&plan.key),
    };
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM evaluation_plans WHERE version_id = ?",
            [&version_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if exists.is_some() {
        return Err(HandlerErr::new(
            "duplicate",
            format!("versionId already exists: {}", version_id),
        ));
    }

    let plan_id = Uuid::new_v4().to_string();
    let academic_year = academic_year_from(&plan.key.semester);
    let created_at = now_rfc3339();

    let tx = conn.unchecked_transaction().map_err(db_err)?;
    if let Err(e) = tx.execute(
        "INSERT INTO evaluation_plans(
            id, version_id, semester, subject_code, group_number, academic_year,
            professor_id, created_by, version_name, parent_plan_id,
            is_main_version, is_approved, is_active, usage_count, comment_count, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 1, 0, 0, ?)",
        (
            &plan_id,
            &version_id,
            &plan.key.semester,
            &plan.key.subject_code,
            plan.key.group_number,
            &academic_year,
            &plan.professor_id,
            &plan.created_by,
            &plan.version_name,
            &plan.parent_plan_id,
            plan.is_approved as i64,
            &created_at,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::new("db_insert_failed", e.to_string()));
    }
    for (i, a) in plan.activities.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO plan_activities(id, plan_id, sort_order, name, percentage, description, due_date)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &plan_id,
                i as i64,
                a.name.trim(),
                a.percentage,
                &a.description,
                &a.due_date,
            ),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_insert_failed", e.to_string()));
        }
    }
    if let Err(e) = tx.commit() {
        return Err(HandlerErr::new("db_tx_failed", e.to_string()));
    }
    Ok(plan_id)
}

pub(super) fn read_plan(
    conn: &Connection,
    plan_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, version_id, semester, subject_code, group_number, academic_year,
                    professor_id, created_by, version_name, parent_plan_id,
                    is_main_version, is_approved, is_active, usage_count, comment_count,
                    created_at, updated_at
             FROM evaluation_plans
             WHERE id = ?",
            [plan_id],
            |r| {
                Ok(json!({
                    "planId": r.get::<_, String>(0)?,
                    "versionId": r.get::<_, String>(1)?,
                    "semester": r.get::<_, String>(2)?,
                    "subjectCode": r.get::<_, String>(3)?,
                    "groupNumber": r.get::<_, i64>(4)?,
                    "academicYear": r.get::<_, Option<String>>(5)?,
                    "professorId": r.get::<_, String>(6)?,
                    "createdBy": r.get::<_, Option<String>>(7)?,
                    "versionName": r.get::<_, String>(8)?,
                    "parentPlanId": r.get::<_, Option<String>>(9)?,
                    "isMainVersion": r.get::<_, i64>(10)? != 0,
                    "isApproved": r.get::<_, i64>(11)? != 0,
                    "isActive": r.get::<_, i64>(12)? != 0,
                    "usageCount": r.get::<_, i64>(13)?,
                    "commentCount": r.get::<_, i64>(14)?,
                    "createdAt": r.get::<_, String>(15)?,
                    "updatedAt": r.get::<_, Option<String>>(16)?,
                }))
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some(mut plan) = row else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT name, percentage, description, due_date
             FROM plan_activities
             WHERE plan_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let activities: Vec<serde_json::Value> = stmt
        .query_map([plan_id], |r| {
            Ok(json!({
                "name": r.get::<_, String>(0)?,
                "percentage": r.get::<_, f64>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "dueDate": r.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    plan["activities"] = json!(activities);
    Ok(Some(plan))
}

fn handle_plans_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let key = match parse_offering_key(&req.params) {
        Ok(k) => k,
        Err(e) => return e.response(&req.id),
    };
    let professor_id = match req.params.get("professorId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing professorId", None),
    };
    let activities = match parse_activities(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let plan = NewPlan {
        key,
        professor_id,
        created_by: req
            .params
            .get("createdBy")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        version_id: req
            .params
            .get("versionId")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        // "Plan Principal" is assigned by the election, never at creation.
        version_name: req
            .params
            .get("versionName")
            .and_then(|v| v.as_str())
            .unwrap_or(elect::ALTERNATIVE_VERSION_NAME)
            .to_string(),
        parent_plan_id: req
            .params
            .get("parentPlanId")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        is_approved: req
            .params
            .get("isApproved")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        activities,
    };

    let plan_id = match insert_plan(conn, plan) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match read_plan(conn, &plan_id) {
        Ok(Some(p)) => ok(&req.id, json!({ "plan": p })),
        Ok(None) => err(&req.id, "not_found", "plan not found after insert", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_plans_create_version(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let key = match parse_offering_key(&req.params) {
        Ok(k) => k,
        Err(e) => return e.response(&req.id),
    };
    let professor_id = match req.params.get("professorId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing professorId", None),
    };
    let activities = match parse_activities(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Alternative versions never start main and carry fresh counters.
    let plan = NewPlan {
        key,
        professor_id,
        created_by: req
            .params
            .get("createdBy")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        version_id: None,
        version_name: req
            .params
            .get("versionName")
            .and_then(|v| v.as_str())
            .unwrap_or(elect::ALTERNATIVE_VERSION_NAME)
            .to_string(),
        parent_plan_id: req
            .params
            .get("parentPlanId")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        is_approved: true,
        activities,
    };

    let plan_id = match insert_plan(conn, plan) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match read_plan(conn, &plan_id) {
        Ok(Some(p)) => ok(&req.id, json!({ "plan": p })),
        Ok(None) => err(&req.id, "not_found", "plan not found after insert", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_plans_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(plan_id) = req.params.get("planId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing planId", None);
    };

    let current: Option<(String, i64)> = match conn
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
    let Some((semester, was_approved)) = current else {
        return err(&req.id, "not_found", "plan not found", None);
    };

    let new_activities = if req.params.get("activities").is_some() {
        match parse_activities(&req.params) {
            Ok(v) => Some(v),
            Err(e) => return e.response(&req.id),
        }
    } else {
        None
    };
    let version_name = req.params.get("versionName").and_then(|v| v.as_str());
    let is_approved = req.params.get("isApproved").and_then(|v| v.as_bool());

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Some(activities) = &new_activities {
        if let Err(e) = tx.execute("DELETE FROM plan_activities WHERE plan_id = ?", [plan_id]) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
        for (i, a) in activities.iter().enumerate() {
            if let Err(e) = tx.execute(
                "INSERT INTO plan_activities(id, plan_id, sort_order, name, percentage, description, due_date)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    plan_id,
                    i as i64,
                    a.name.trim(),
                    a.percentage,
                    &a.description,
                    &a.due_date,
                ),
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
    }

    // Editing the scheme of an approved plan sends it back through approval.
    let next_approved = match (is_approved, &new_activities) {
        (Some(explicit), _) => explicit as i64,
        (None, Some(_)) if was_approved != 0 => 0,
        (None, _) => was_approved,
    };

    if let Err(e) = tx.execute(
        "UPDATE evaluation_plans
         SET version_name = COALESCE(?, version_name),
             is_approved = ?,
             academic_year = COALESCE(academic_year, ?),
             updated_at = ?
         WHERE id = ?",
        (
            version_name,
            next_approved,
            academic_year_from(&semester),
            now_rfc3339(),
            plan_id,
        ),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match read_plan(conn, plan_id) {
        Ok(Some(p)) => ok(&req.id, json!({ "plan": p })),
        Ok(None) => err(&req.id, "not_found", "plan not found", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_plans_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(plan_id) = req.params.get("planId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing planId", None);
    };
    match read_plan(conn, plan_id) {
        Ok(Some(p)) => ok(&req.id, json!({ "plan": p })),
        Ok(None) => err(&req.id, "not_found", "plan not found", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_plans_list_versions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let key = match parse_offering_key(&req.params) {
        Ok(k) => k,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT id FROM evaluation_plans
         WHERE semester = ? AND subject_code = ? AND group_number = ? AND is_active = 1
         ORDER BY is_main_version DESC, usage_count DESC, created_at ASC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ids: Vec<String> = match stmt
        .query_map((&key.semester, &key.subject_code, key.group_number), |r| {
            r.get(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut plans = Vec::with_capacity(ids.len());
    for id in &ids {
        match read_plan(conn, id) {
            Ok(Some(p)) => plans.push(p),
            Ok(None) => {}
            Err(e) => return e.response(&req.id),
        }
    }
    ok(&req.id, json!({ "plans": plans }))
}

fn handle_plans_deactivate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(plan_id) = req.params.get("planId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing planId", None);
    };

    let key: Option<(String, String, i64)> = match conn
        .query_row(
            "SELECT semester, subject_code, group_number
             FROM evaluation_plans WHERE id = ? AND is_active = 1",
            [plan_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((semester, subject_code, group_number)) = key else {
        return err(&req.id, "not_found", "plan not found", None);
    };

    if let Err(e) = conn.execute(
        "UPDATE evaluation_plans
         SET is_active = 0, is_main_version = 0, updated_at = ?
         WHERE id = ?",
        (now_rfc3339(), plan_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // A deactivated main must hand the flag to the next-best sibling.
    let new_main =
        match elect::find_or_create_main_version(conn, &semester, &subject_code, group_number) {
            Ok(v) => v,
            Err(e) => return HandlerErr::from(e).response(&req.id),
        };
    ok(
        &req.id,
        json!({ "planId": plan_id, "mainPlanId": new_main }),
    )
}

fn handle_plans_increment(
    state: &mut AppState,
    req: &Request,
    counter: &str,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(plan_id) = req.params.get("planId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing planId", None);
    };

    let result = match counter {
        "usage" => elect::increment_usage(conn, plan_id),
        _ => elect::increment_comments(conn, plan_id),
    };
    if let Err(e) = result {
        return HandlerErr::from(e).response(&req.id);
    }

    match read_plan(conn, plan_id) {
        Ok(Some(p)) => ok(&req.id, json!({ "plan": p })),
        Ok(None) => err(&req.id, "not_found", "plan not found", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_plans_elect_main(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let key = match parse_offering_key(&req.params) {
        Ok(k) => k,
        Err(e) => return e.response(&req.id),
    };

    let winner = match elect::find_or_create_main_version(
        conn,
        &key.semester,
        &key.subject_code,
        key.group_number,
    ) {
        Ok(v) => v,
        Err(e) => return HandlerErr::from(e).response(&req.id),
    };
    let Some(winner) = winner else {
        return ok(&req.id, json!({ "mainPlan": null }));
    };
    match read_plan(conn, &winner) {
        Ok(Some(p)) => ok(&req.id, json!({ "mainPlan": p })),
        Ok(None) => err(&req.id, "not_found", "plan not found", None),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "plans.create" => Some(handle_plans_create(state, req)),
        "plans.createVersion" => Some(handle_plans_create_version(state, req)),
        "plans.update" => Some(handle_plans_update(state, req)),
        "plans.get" => Some(handle_plans_get(state, req)),
        "plans.listVersions" => Some(handle_plans_list_versions(state, req)),
        "plans.deactivate" => Some(handle_plans_deactivate(state, req)),
        "plans.incrementUsage" => Some(handle_plans_increment(state, req, "usage")),
        "plans.incrementComments" => Some(handle_plans_increment(state, req, "comments")),
        "plans.electMain" => Some(handle_plans_elect_main(state, req)),
        _ => None,
    }
}
