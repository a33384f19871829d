use super::plans::{db_err, parse_offering_key, HandlerErr};
use crate::calc::{self, ActivityGrade};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const DISTRIBUTION_BUCKETS: [&str; 5] = ["0-1", "1-2", "2-3", "3-4", "4-5"];

struct RecordStat {
    status: String,
    current_grade: f64,
    completed_percentage: f64,
}

fn load_plan_record_stats(
    conn: &Connection,
    plan_id: &str,
) -> Result<Vec<RecordStat>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, status, target_grade FROM grade_records WHERE plan_id = ?")
        .map_err(db_err)?;
    let heads: Vec<(String, String, Option<f64>)> = stmt
        .query_map([plan_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut act_stmt = conn
        .prepare(
            "SELECT name, percentage, score, max_score
             FROM grade_activities
             WHERE record_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;

    let mut out = Vec::with_capacity(heads.len());
    for (record_id, status, target) in heads {
        let grades: Vec<ActivityGrade> = act_stmt
            .query_map([&record_id], |r| {
                Ok(ActivityGrade {
                    name: r.get(0)?,
                    percentage: r.get(1)?,
                    score: r.get(2)?,
                    max_score: r.get(3)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;
        let progress = calc::compute_progress(&grades, target);
        out.push(RecordStat {
            status,
            current_grade: progress.current_weighted_grade,
            completed_percentage: progress.completed_percentage,
        });
    }
    Ok(out)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0_usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count > 0 {
        Some(calc::round2(sum / count as f64))
    } else {
        None
    }
}

fn summarize(stats: &[RecordStat]) -> serde_json::Value {
    let mut passed = 0_usize;
    let mut failed = 0_usize;
    let mut withdrawn = 0_usize;
    let mut in_progress = 0_usize;
    let mut buckets = [0_usize; 5];

    for s in stats {
        match s.status.as_str() {
            "passed" => passed += 1,
            "failed" => failed += 1,
            "withdrawn" => withdrawn += 1,
            _ => in_progress += 1,
        }
        let idx = (s.current_grade.floor() as usize).min(DISTRIBUTION_BUCKETS.len() - 1);
        buckets[idx] += 1;
    }

    let completed = passed + failed;
    let pass_rate = if completed > 0 {
        calc::round2(passed as f64 / completed as f64)
    } else {
        0.0
    };
    let distribution: Vec<serde_json::Value> = DISTRIBUTION_BUCKETS
        .iter()
        .zip(buckets.iter())
        .map(|(range, count)| json!({ "range": range, "count": count }))
        .collect();

    json!({
        "recordCount": stats.len(),
        "averageGrade": mean(stats.iter().map(|s| s.current_grade)),
        "averageCompletion": mean(stats.iter().map(|s| s.completed_percentage)),
        "passedCount": passed,
        "failedCount": failed,
        "withdrawnCount": withdrawn,
        "inProgressCount": in_progress,
        "completedCount": completed,
        "passRate": pass_rate,
        "distribution": distribution,
    })
}

fn handle_stats_plan_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(plan_id) = req.params.get("planId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing planId", None);
    };

    let exists: bool = match conn.query_row(
        "SELECT COUNT(*) FROM evaluation_plans WHERE id = ?",
        [plan_id],
        |r| r.get::<_, i64>(0),
    ) {
        Ok(n) => n > 0,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "plan not found", None);
    }

    let stats = match load_plan_record_stats(conn, plan_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let mut summary = summarize(&stats);
    summary["planId"] = json!(plan_id);
    ok(&req.id, summary)
}

fn handle_stats_offering_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let key = match parse_offering_key(&req.params) {
        Ok(k) => k,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, version_id, version_name, is_main_version, usage_count, comment_count
         FROM evaluation_plans
         WHERE semester = ? AND subject_code = ? AND group_number = ? AND is_active = 1
         ORDER BY is_main_version DESC, usage_count DESC, created_at ASC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let plans: Vec<(String, String, String, i64, i64, i64)> = match stmt
        .query_map((&key.semester, &key.subject_code, key.group_number), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut per_plan = Vec::with_capacity(plans.len());
    let mut all_grades: Vec<f64> = Vec::new();
    let mut total_records = 0_usize;
    for (plan_id, version_id, version_name, is_main, usage, comments) in &plans {
        let stats = match load_plan_record_stats(conn, plan_id) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        total_records += stats.len();
        all_grades.extend(stats.iter().map(|s| s.current_grade));
        per_plan.push(json!({
            "planId": plan_id,
            "versionId": version_id,
            "versionName": version_name,
            "isMainVersion": *is_main != 0,
            "usageCount": usage,
            "commentCount": comments,
            "recordCount": stats.len(),
            "averageGrade": mean(stats.iter().map(|s| s.current_grade)),
        }));
    }

    ok(
        &req.id,
        json!({
            "semester": key.semester,
            "subjectCode": key.subject_code,
            "groupNumber": key.group_number,
            "planCount": plans.len(),
            "recordCount": total_records,
            "averageGrade": mean(all_grades.into_iter()),
            "plans": per_plan,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.planSummary" => Some(handle_stats_plan_summary(state, req)),
        "stats.offeringSummary" => Some(handle_stats_offering_summary(state, req)),
        _ => None,
    }
}
