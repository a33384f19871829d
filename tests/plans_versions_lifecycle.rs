use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

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

fn request(
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn alternative_versions_and_main_reassignment_on_deactivate() {
    let workspace = temp_dir("evalplan-lifecycle");
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
    let base = created.get("plan").expect("plan");
    let base_id = base
        .get("planId")
        .and_then(|v| v.as_str())
        .expect("planId")
        .to_string();
    // Nothing is labelled main until an election runs.
    assert_eq!(
        base.get("versionName").and_then(|v| v.as_str()),
        Some("Versión Alternativa")
    );
    assert_eq!(base.get("isMainVersion").and_then(|v| v.as_bool()), Some(false));
    std::thread::sleep(Duration::from_millis(30));

    // A student proposes an alternative weighting for the same offering.
    let version = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "plans.createVersion",
        json!({
            "semester": "2025-1",
            "subjectCode": "MAT101",
            "groupNumber": 1,
            "professorId": "prof-1",
            "createdBy": "stu-4",
            "parentPlanId": base_id,
            "activities": [
                { "name": "Parcial", "percentage": 30.0 },
                { "name": "Final", "percentage": 70.0 }
            ]
        }),
    );
    let alt = version.get("plan").expect("plan");
    let alt_id = alt
        .get("planId")
        .and_then(|v| v.as_str())
        .expect("planId")
        .to_string();
    assert_eq!(alt.get("versionName").and_then(|v| v.as_str()), Some("Versión Alternativa"));
    assert_eq!(alt.get("parentPlanId").and_then(|v| v.as_str()), Some(base_id.as_str()));
    assert_eq!(alt.get("isMainVersion").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(alt.get("isApproved").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(alt.get("usageCount").and_then(|v| v.as_i64()), Some(0));

    // Two adoptions of the alternative vs one of the base.
    for (rid, student, plan) in [
        ("4", "stu-1", &alt_id),
        ("5", "stu-2", &alt_id),
        ("6", "stu-3", &base_id),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            rid,
            "grades.create",
            json!({ "studentId": student, "planId": plan }),
        );
    }

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "plans.listVersions",
        json!({ "semester": "2025-1", "subjectCode": "MAT101", "groupNumber": 1 }),
    );
    let plans = listed.get("plans").and_then(|v| v.as_array()).expect("plans");
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0].get("planId").and_then(|v| v.as_str()), Some(alt_id.as_str()));
    assert_eq!(plans[0].get("isMainVersion").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(plans[0].get("usageCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(plans[1].get("planId").and_then(|v| v.as_str()), Some(base_id.as_str()));
    assert_eq!(
        plans[1].get("versionName").and_then(|v| v.as_str()),
        Some("Versión Alternativa")
    );

    // Deactivating the elected main hands the flag to the surviving sibling.
    let deactivated = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "plans.deactivate",
        json!({ "planId": alt_id }),
    );
    assert_eq!(
        deactivated.get("mainPlanId").and_then(|v| v.as_str()),
        Some(base_id.as_str())
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "plans.listVersions",
        json!({ "semester": "2025-1", "subjectCode": "MAT101", "groupNumber": 1 }),
    );
    let plans = listed.get("plans").and_then(|v| v.as_array()).expect("plans");
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].get("planId").and_then(|v| v.as_str()), Some(base_id.as_str()));
    assert_eq!(plans[0].get("isMainVersion").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        plans[0].get("versionName").and_then(|v| v.as_str()),
        Some("Plan Principal")
    );

    // Inactive plans are gone from every mutation path.
    let bumped = request(
        &mut stdin,
        &mut reader,
        "10",
        "plans.incrementUsage",
        json!({ "planId": alt_id }),
    );
    assert_eq!(bumped.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        bumped
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );
    let updated = request(
        &mut stdin,
        &mut reader,
        "11",
        "plans.update",
        json!({ "planId": alt_id, "versionName": "Nueva" }),
    );
    assert_eq!(updated.get("ok").and_then(|v| v.as_bool()), Some(false));

    // But it still resolves for display.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "plans.get",
        json!({ "planId": alt_id }),
    );
    assert_eq!(
        fetched
            .get("plan")
            .and_then(|p| p.get("isActive"))
            .and_then(|v| v.as_bool()),
        Some(false)
    );
}

#[test]
fn explicit_version_ids_must_be_unique() {
    let workspace = temp_dir("evalplan-versionid");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let params = json!({
        "semester": "2025-1",
        "subjectCode": "MAT101",
        "groupNumber": 1,
        "professorId": "prof-1",
        "versionId": "MAT101_2025-1_1_custom",
        "activities": [
            { "name": "Proyecto", "percentage": 100.0 }
        ]
    });
    let _ = request_ok(&mut stdin, &mut reader, "2", "plans.create", params.clone());
    let duplicated = request(&mut stdin, &mut reader, "3", "plans.create", params);
    assert_eq!(duplicated.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        duplicated
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("duplicate")
    );
}
