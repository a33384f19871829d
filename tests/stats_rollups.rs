use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_evalpland");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn evalpland");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn bucket_counts(summary: &serde_json::Value) -> Vec<i64> {
    summary
        .get("distribution")
        .and_then(|v| v.as_array())
        .expect("distribution")
        .iter()
        .map(|b| b.get("count").and_then(|v| v.as_i64()).expect("count"))
        .collect()
}

#[test]
fn plan_and_offering_summaries_roll_up_record_progress() {
    let workspace = temp_dir("evalplan-stats");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "plans.create",
        json!({
            "semester": "2025-1",
            "subjectCode": "MAT101",
            "groupNumber": 1,
            "professorId": "prof-1",
            "activities": [
                { "name": "Parcial", "percentage": 50.0 },
                { "name": "Final", "percentage": 50.0 }
            ]
        }),
    );
    let plan_id = created
        .get("plan")
        .and_then(|p| p.get("planId"))
        .and_then(|v| v.as_str())
        .expect("planId")
        .to_string();

    // Three cohorts: a clean pass, a clean fail, and a half-finished record.
    let mut record_ids = Vec::new();
    for (rid, student) in [("3", "stu-1"), ("4", "stu-2"), ("5", "stu-3")] {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            rid,
            "grades.create",
            json!({ "studentId": student, "planId": plan_id }),
        );
        record_ids.push(
            created
                .get("record")
                .and_then(|r| r.get("recordId"))
                .and_then(|v| v.as_str())
                .expect("recordId")
                .to_string(),
        );
    }
    let scores: [(&str, &[(&str, f64)]); 3] = [
        ("6", &[("Parcial", 4.0), ("Final", 4.0)]),
        ("8", &[("Parcial", 2.0), ("Final", 2.0)]),
        ("10", &[("Parcial", 5.0)]),
    ];
    for ((base_id, pairs), record_id) in scores.iter().zip(record_ids.iter()) {
        for (offset, (activity, score)) in pairs.iter().enumerate() {
            let rid = format!("{}-{}", base_id, offset);
            let _ = request_ok(
                &mut stdin,
                &mut reader,
                &rid,
                "grades.updateScore",
                json!({
                    "recordId": record_id,
                    "activityName": activity,
                    "score": score
                }),
            );
        }
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "stats.planSummary",
        json!({ "planId": plan_id }),
    );
    assert_eq!(summary.get("planId").and_then(|v| v.as_str()), Some(plan_id.as_str()));
    assert_eq!(summary.get("recordCount").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(summary.get("passedCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(summary.get("failedCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(summary.get("inProgressCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(summary.get("withdrawnCount").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(summary.get("completedCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(summary.get("passRate").and_then(|v| v.as_f64()), Some(0.5));
    // (4.0 + 2.0 + 2.5) / 3
    assert_eq!(summary.get("averageGrade").and_then(|v| v.as_f64()), Some(2.83));
    // (100 + 100 + 50) / 3
    assert_eq!(
        summary.get("averageCompletion").and_then(|v| v.as_f64()),
        Some(83.33)
    );
    assert_eq!(bucket_counts(&summary), vec![0, 0, 2, 0, 1]);

    // Withdrawing the half-finished record moves it out of in_progress.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "grades.withdraw",
        json!({ "recordId": record_ids[2] }),
    );
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "stats.planSummary",
        json!({ "planId": plan_id }),
    );
    assert_eq!(summary.get("withdrawnCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(summary.get("inProgressCount").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(summary.get("completedCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(summary.get("passRate").and_then(|v| v.as_f64()), Some(0.5));

    let offering = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "stats.offeringSummary",
        json!({ "semester": "2025-1", "subjectCode": "MAT101", "groupNumber": 1 }),
    );
    assert_eq!(offering.get("planCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(offering.get("recordCount").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(offering.get("averageGrade").and_then(|v| v.as_f64()), Some(2.83));
    let plans = offering.get("plans").and_then(|v| v.as_array()).expect("plans");
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].get("planId").and_then(|v| v.as_str()), Some(plan_id.as_str()));
    assert_eq!(plans[0].get("usageCount").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(plans[0].get("isMainVersion").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(plans[0].get("recordCount").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(plans[0].get("averageGrade").and_then(|v| v.as_f64()), Some(2.83));
}

#[test]
fn empty_rollups_report_null_averages() {
    let workspace = temp_dir("evalplan-stats-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "plans.create",
        json!({
            "semester": "2025-1",
            "subjectCode": "BIO100",
            "groupNumber": 2,
            "professorId": "prof-3",
            "activities": [
                { "name": "Proyecto", "percentage": 100.0 }
            ]
        }),
    );
    let plan_id = created
        .get("plan")
        .and_then(|p| p.get("planId"))
        .and_then(|v| v.as_str())
        .expect("planId")
        .to_string();

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "stats.planSummary",
        json!({ "planId": plan_id }),
    );
    assert_eq!(summary.get("recordCount").and_then(|v| v.as_i64()), Some(0));
    assert!(summary.get("averageGrade").expect("averageGrade").is_null());
    assert_eq!(summary.get("passRate").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(bucket_counts(&summary), vec![0, 0, 0, 0, 0]);
}
