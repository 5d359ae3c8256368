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
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
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

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn create_user(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    role: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "directory.upsertUser",
        json!({ "name": name, "role": role }),
    );
    created
        .get("userId")
        .and_then(|v| v.as_str())
        .expect("userId")
        .to_string()
}

fn period_item(subject: &str, teacher: &str, start: &str, end: &str) -> serde_json::Value {
    json!({
        "subject": subject,
        "teacherId": teacher,
        "startTime": start,
        "endTime": end
    })
}

#[test]
fn replace_day_rewrites_periods_and_assignments_together() {
    let workspace = temp_dir("timetabled-replace-day");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = create_user(&mut stdin, &mut reader, "2", "Admin", "admin");
    let t1 = create_user(&mut stdin, &mut reader, "3", "Asha Verma", "staff");
    let t2 = create_user(&mut stdin, &mut reader, "4", "Binod Rai", "staff");

    let replaced = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.replaceDay",
        json!({
            "actorId": admin,
            "classId": "5-A",
            "academicYear": "2024",
            "day": "Monday",
            "firstPeriodTeacherId": t1,
            "periods": [
                period_item("Mathematics", &t1, "08:00", "08:45"),
                period_item("Physics", &t2, "09:30", "10:15")
            ]
        }),
    );
    assert_eq!(
        replaced
            .get("periods")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "staffAssignments.listForClass",
        json!({ "actorId": admin, "classId": "5-A", "academicYear": "2024", "day": "Monday" }),
    );
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2),
        "day replacement must rewrite the assignment store too"
    );

    // Replacing again shrinks the day rather than accreting.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.replaceDay",
        json!({
            "actorId": admin,
            "classId": "5-A",
            "academicYear": "2024",
            "day": "Monday",
            "periods": [ period_item("Mathematics", &t1, "11:00", "11:45") ]
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "staffAssignments.listForClass",
        json!({ "actorId": admin, "classId": "5-A", "academicYear": "2024", "day": "Monday" }),
    );
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    let tt = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "timetable.classGet",
        json!({ "actorId": admin, "classId": "5-A", "academicYear": "2024" }),
    );
    assert_eq!(
        tt.pointer("/timetable/days/0/periods/0/periodNumber")
            .and_then(|v| v.as_i64()),
        Some(5)
    );
    assert_eq!(
        tt.pointer("/timetable/firstPeriodTeacher/id")
            .and_then(|v| v.as_str()),
        Some(t1.as_str())
    );
}

#[test]
fn replace_day_enforces_the_admission_rules() {
    let workspace = temp_dir("timetabled-replace-day-rules");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = create_user(&mut stdin, &mut reader, "2", "Admin", "admin");
    let t1 = create_user(&mut stdin, &mut reader, "3", "Asha Verma", "staff");

    // Back-to-back periods for the same teacher.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.replaceDay",
        json!({
            "actorId": admin,
            "classId": "5-A",
            "academicYear": "2024",
            "day": "Monday",
            "periods": [
                period_item("Mathematics", &t1, "08:00", "08:45"),
                period_item("Drawing", &t1, "08:45", "09:30")
            ]
        }),
    );
    assert_eq!(code, "consecutive_period_conflict");

    // A failed replacement must leave nothing behind.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "staffAssignments.listForClass",
        json!({ "actorId": admin, "classId": "5-A", "academicYear": "2024" }),
    );
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    // Two entries claiming the same slot.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.replaceDay",
        json!({
            "actorId": admin,
            "classId": "5-A",
            "academicYear": "2024",
            "day": "Monday",
            "periods": [
                period_item("Mathematics", &t1, "08:00", "08:45"),
                period_item("Drawing", &t1, "08:00", "08:45")
            ]
        }),
    );
    assert_eq!(code, "bad_params");

    // Off-calendar slot.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.replaceDay",
        json!({
            "actorId": admin,
            "classId": "5-A",
            "academicYear": "2024",
            "day": "Monday",
            "periods": [ period_item("Mathematics", &t1, "08:10", "08:55") ]
        }),
    );
    assert_eq!(code, "unknown_time_slot");

    // Unknown first-period teacher.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "8",
        "timetable.replaceDay",
        json!({
            "actorId": admin,
            "classId": "5-A",
            "academicYear": "2024",
            "day": "Monday",
            "firstPeriodTeacherId": "no-such-user",
            "periods": []
        }),
    );
    assert_eq!(code, "teacher_not_found");
}

#[test]
fn period_update_moves_slot_and_keeps_store_in_step() {
    let workspace = temp_dir("timetabled-period-update");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = create_user(&mut stdin, &mut reader, "2", "Admin", "admin");
    let t1 = create_user(&mut stdin, &mut reader, "3", "Asha Verma", "staff");
    let t2 = create_user(&mut stdin, &mut reader, "4", "Binod Rai", "staff");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.replaceDay",
        json!({
            "actorId": admin,
            "classId": "5-A",
            "academicYear": "2024",
            "day": "Monday",
            "periods": [
                period_item("Mathematics", &t1, "08:00", "08:45"),
                period_item("Physics", &t2, "09:30", "10:15")
            ]
        }),
    );
    let tt = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.classGet",
        json!({ "actorId": admin, "classId": "5-A", "academicYear": "2024" }),
    );
    let period_id = tt
        .pointer("/timetable/days/0/periods/0/id")
        .and_then(|v| v.as_str())
        .expect("period id")
        .to_string();

    // Move period 1 to period 6 and hand it to the other teacher.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.periodUpdate",
        json!({
            "actorId": admin,
            "periodId": period_id,
            "subject": "Geography",
            "teacherId": t2,
            "startTime": "11:45",
            "endTime": "12:30"
        }),
    );
    assert_eq!(
        updated.pointer("/period/periodNumber").and_then(|v| v.as_i64()),
        Some(6)
    );
    assert_eq!(
        updated.pointer("/period/id").and_then(|v| v.as_str()),
        Some(period_id.as_str()),
        "a moved period keeps its identity"
    );

    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "staffAssignments.listForTeacher",
        json!({ "actorId": admin, "teacherId": t2, "academicYear": "2024" }),
    );
    let rows = rows
        .get("assignments")
        .and_then(|v| v.as_array())
        .expect("assignments");
    assert_eq!(rows.len(), 2);
    assert!(
        rows.iter().any(|a| {
            a.pointer("/timeSlot/startTime").and_then(|v| v.as_str()) == Some("11:45")
                && a.get("subject").and_then(|v| v.as_str()) == Some("Geography")
        }),
        "store row must follow the period edit: {:?}",
        rows
    );

    // Moving onto the other period's slot is refused.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "9",
        "timetable.periodUpdate",
        json!({
            "actorId": admin,
            "periodId": period_id,
            "subject": "Geography",
            "teacherId": t2,
            "startTime": "09:30",
            "endTime": "10:15"
        }),
    );
    assert_eq!(code, "duplicate_slot");

    // Off-calendar times are refused.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "10",
        "timetable.periodUpdate",
        json!({
            "actorId": admin,
            "periodId": period_id,
            "subject": "Geography",
            "teacherId": t2,
            "startTime": "10:00",
            "endTime": "10:45"
        }),
    );
    assert_eq!(code, "unknown_time_slot");
}

#[test]
fn period_delete_removes_the_backing_assignment() {
    let workspace = temp_dir("timetabled-period-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = create_user(&mut stdin, &mut reader, "2", "Admin", "admin");
    let t1 = create_user(&mut stdin, &mut reader, "3", "Asha Verma", "staff");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.replaceDay",
        json!({
            "actorId": admin,
            "classId": "5-A",
            "academicYear": "2024",
            "day": "Monday",
            "periods": [ period_item("Mathematics", &t1, "08:00", "08:45") ]
        }),
    );
    let tt = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.classGet",
        json!({ "actorId": admin, "classId": "5-A", "academicYear": "2024" }),
    );
    let period_id = tt
        .pointer("/timetable/days/0/periods/0/id")
        .and_then(|v| v.as_str())
        .expect("period id")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.periodDelete",
        json!({ "actorId": admin, "periodId": period_id }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "staffAssignments.listForClass",
        json!({ "actorId": admin, "classId": "5-A", "academicYear": "2024" }),
    );
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "8",
        "timetable.periodGet",
        json!({ "actorId": admin, "periodId": period_id }),
    );
    assert_eq!(code, "not_found");
}
