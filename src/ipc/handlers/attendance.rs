use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    academic_year_or_default, class_ref_from_params, get_required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUSES: [&str; 3] = ["present", "absent", "late"];

fn parse_date(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    NaiveDate::parse_from_str(t, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "date must be YYYY-MM-DD".to_string(),
        details: Some(json!({ "date": raw })),
    })?;
    Ok(t.to_string())
}

struct Entry {
    student_id: String,
    status: String,
}

fn parse_entries(params: &serde_json::Value) -> Result<Vec<Entry>, HandlerErr> {
    let Some(items) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries"));
    };
    let mut out = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                HandlerErr::new("bad_params", format!("entries[{}] missing studentId", idx))
            })?;
        let status = item
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                HandlerErr::new("bad_params", format!("entries[{}] missing status", idx))
            })?;
        if !STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("entries[{}] status must be present, absent, or late", idx),
                details: Some(json!({ "status": status })),
            });
        }
        out.push(Entry { student_id, status });
    }
    Ok(out)
}

/// Marking a day's register is reserved for an admin or the class's
/// first-period teacher, matching the school's standing rule.
fn mark_day(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let class_ref = class_ref_from_params(params)?;
    let academic_year = academic_year_or_default(params);
    let date = parse_date(&get_required_str(params, "date")?)?;
    let entries = parse_entries(params)?;

    let timetable: Option<Option<String>> = conn
        .query_row(
            "SELECT first_period_teacher FROM timetables
             WHERE class_num = ? AND section = ? AND academic_year = ?",
            (class_ref.class_num, &class_ref.section, &academic_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some(first_period_teacher) = timetable else {
        return Err(HandlerErr::new("not_found", "timetable not found"));
    };

    let actor_role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [&actor_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let is_admin = actor_role.as_deref() == Some("admin");
    let is_first_period_teacher = first_period_teacher.as_deref() == Some(actor_id.as_str());
    if !is_admin && !is_first_period_teacher {
        return Err(HandlerErr::new(
            "forbidden",
            "only the first period teacher or admin can mark attendance",
        ));
    }

    for entry in &entries {
        let known: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE id = ? AND role = 'student'",
                [&entry.student_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        if known.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "student not found".to_string(),
                details: Some(json!({ "studentId": entry.student_id })),
            });
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let day_id = Uuid::new_v4().to_string();
    let updated_at = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO attendance_days(id, class_num, section, date, marked_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_num, section, date) DO UPDATE SET
           marked_by = excluded.marked_by,
           updated_at = excluded.updated_at",
        (
            &day_id,
            class_ref.class_num,
            &class_ref.section,
            &date,
            &actor_id,
            &updated_at,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    let day_id: String = tx
        .query_row(
            "SELECT id FROM attendance_days WHERE class_num = ? AND section = ? AND date = ?",
            (class_ref.class_num, &class_ref.section, &date),
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    tx.execute(
        "DELETE FROM attendance_entries WHERE attendance_day_id = ?",
        [&day_id],
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    for entry in &entries {
        tx.execute(
            "INSERT INTO attendance_entries(attendance_day_id, student_id, status)
             VALUES(?, ?, ?)",
            (&day_id, &entry.student_id, &entry.status),
        )
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "attendance": {
            "id": day_id,
            "classId": class_ref.label(),
            "date": date,
            "markedBy": actor_id,
            "entryCount": entries.len()
        }
    }))
}

fn list_for_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_ref = class_ref_from_params(params)?;
    let date = params
        .get("date")
        .and_then(|v| v.as_str())
        .map(parse_date)
        .transpose()?;

    let mut stmt = conn
        .prepare(
            "SELECT d.id, d.date, d.marked_by, u.name, d.updated_at
             FROM attendance_days d
             JOIN users u ON u.id = d.marked_by
             WHERE d.class_num = ? AND d.section = ?
               AND (? IS NULL OR d.date = ?)
             ORDER BY d.date DESC",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let day_rows = stmt
        .query_map(
            (class_ref.class_num, &class_ref.section, &date, &date),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut days = Vec::new();
    for (day_id, day_date, marked_by, marker_name, updated_at) in day_rows {
        let mut entry_stmt = conn
            .prepare(
                "SELECT e.student_id, u.name, e.status
                 FROM attendance_entries e
                 JOIN users u ON u.id = e.student_id
                 WHERE e.attendance_day_id = ?
                 ORDER BY u.name",
            )
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        let entries = entry_stmt
            .query_map([&day_id], |r| {
                let student_id: String = r.get(0)?;
                let student_name: String = r.get(1)?;
                let status: String = r.get(2)?;
                Ok(json!({
                    "studentId": student_id,
                    "studentName": student_name,
                    "status": status
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        days.push(json!({
            "id": day_id,
            "classId": class_ref.label(),
            "date": day_date,
            "markedBy": { "id": marked_by, "name": marker_name },
            "updatedAt": updated_at,
            "entries": entries
        }));
    }

    Ok(json!({ "days": days }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.markDay" => Some(with_conn(state, req, mark_day)),
        "attendance.listForClass" => Some(with_conn(state, req, list_for_class)),
        _ => None,
    }
}
