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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
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

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("timetabled-router-smoke");
    let bundle_out = workspace.join("smoke-backup.ttbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let admin_id = create_user(&mut stdin, &mut reader, "3", "Head Admin", "admin");
    let teacher_id = create_user(&mut stdin, &mut reader, "4", "Asha Verma", "staff");
    let student_id = create_user(&mut stdin, &mut reader, "5", "Ravi Kumar", "student");

    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "directory.teachers",
        json!({ "actorId": admin_id }),
    );

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "staffAssignments.submit",
        json!({
            "actorId": admin_id,
            "classId": "5-A",
            "subject": "Mathematics",
            "teacherId": teacher_id,
            "academicYear": "2024",
            "day": "Monday",
            "timeSlot": { "startTime": "09:30", "endTime": "10:15" }
        }),
    );
    let assignment_id = submitted
        .get("assignment")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("assignment id")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "staffAssignments.listForClass",
        json!({ "actorId": admin_id, "classId": "5-A", "academicYear": "2024" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "staffAssignments.listForTeacher",
        json!({ "actorId": admin_id, "teacherId": teacher_id, "academicYear": "2024" }),
    );

    let timetable = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "timetable.classGet",
        json!({ "actorId": admin_id, "classId": "5-A", "academicYear": "2024" }),
    );
    let period_id = timetable
        .pointer("/timetable/days/0/periods/0/id")
        .and_then(|v| v.as_str())
        .expect("period id")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "timetable.periodGet",
        json!({ "actorId": admin_id, "periodId": period_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "timetable.canAssignTeacher",
        json!({
            "actorId": admin_id,
            "classId": "5-A",
            "academicYear": "2024",
            "teacherId": teacher_id,
            "day": "Monday",
            "periodNumber": 6
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "timetable.isTeacherAssigned",
        json!({
            "actorId": admin_id,
            "classId": "5-A",
            "academicYear": "2024",
            "teacherId": teacher_id,
            "day": "Monday"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "timetable.replaceDay",
        json!({
            "actorId": admin_id,
            "classId": "5-A",
            "academicYear": "2024",
            "day": "Tuesday",
            "firstPeriodTeacherId": teacher_id,
            "periods": [
                {
                    "subject": "Mathematics",
                    "teacherId": teacher_id,
                    "startTime": "08:00",
                    "endTime": "08:45"
                }
            ]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "attendance.markDay",
        json!({
            "actorId": admin_id,
            "classId": "5-A",
            "academicYear": "2024",
            "date": "2024-07-01",
            "entries": [ { "studentId": student_id, "status": "present" } ]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "attendance.listForClass",
        json!({ "actorId": admin_id, "classId": "5-A" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "staffAssignments.remove",
        json!({ "actorId": admin_id, "assignmentId": assignment_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
