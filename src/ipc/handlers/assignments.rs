use crate::db::{self, AssignmentInput, AssignmentWriteError};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    academic_year_or_default, get_required_str, parse_class_ref, require_staff, ClassRef,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, SlotSpan};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn parse_slot(params: &serde_json::Value) -> Result<(String, String, u8), HandlerErr> {
    let Some(slot) = params.get("timeSlot") else {
        return Err(HandlerErr::new("bad_params", "missing timeSlot"));
    };
    let start = slot
        .get("startTime")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing timeSlot.startTime"))?;
    let end = slot
        .get("endTime")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing timeSlot.endTime"))?;
    if !schedule::is_canonical_slot(&start, &end) {
        return Err(HandlerErr {
            code: "unknown_time_slot",
            message: "time slot does not match the school period calendar".to_string(),
            details: Some(json!({ "startTime": start, "endTime": end })),
        });
    }
    let Some(period_number) = schedule::period_number_for(&start) else {
        return Err(HandlerErr {
            code: "unknown_time_slot",
            message: "time slot does not match the school period calendar".to_string(),
            details: Some(json!({ "startTime": start, "endTime": end })),
        });
    };
    Ok((start, end, period_number))
}

fn require_school_day(day: &str) -> Result<(), HandlerErr> {
    if schedule::is_school_day(day) {
        return Ok(());
    }
    Err(HandlerErr {
        code: "bad_params",
        message: "day must be a school day, Monday through Saturday".to_string(),
        details: Some(json!({ "day": day })),
    })
}

/// A teacher may hold one subject in one class-section per year. Submitting
/// again for the same class-section is legal (that is how a slot moves or a
/// teacher is swapped); another class-section holding it is a conflict.
pub(super) fn check_subject_exclusivity(
    conn: &Connection,
    teacher_id: &str,
    subject: &str,
    academic_year: &str,
    class_ref: &ClassRef,
) -> Result<(), HandlerErr> {
    let clash: Option<(i64, String)> = conn
        .query_row(
            "SELECT class_num, section FROM staff_assignments
             WHERE teacher_id = ? AND subject = ? AND academic_year = ?
               AND NOT (class_num = ? AND section = ?)
             LIMIT 1",
            (
                teacher_id,
                subject,
                academic_year,
                class_ref.class_num,
                &class_ref.section,
            ),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if let Some((clash_class, clash_section)) = clash {
        return Err(HandlerErr {
            code: "teacher_subject_conflict",
            message: format!(
                "teacher is already assigned to {} in class {}-{}",
                subject, clash_class, clash_section
            ),
            details: None,
        });
    }
    Ok(())
}

pub(super) fn map_write_err(e: AssignmentWriteError) -> HandlerErr {
    match e {
        AssignmentWriteError::Conflict(c) => HandlerErr::new(c.code(), c.message()),
        AssignmentWriteError::DuplicateSlot => HandlerErr::new(
            "duplicate_slot",
            "this time slot is already assigned for this class",
        ),
        AssignmentWriteError::Db(e) => HandlerErr::new("db_update_failed", e.to_string()),
    }
}

fn assignment_json(id: &str, a: &AssignmentInput, period_number: u8) -> serde_json::Value {
    json!({
        "id": id,
        "classId": format!("{}-{}", a.class_num, a.section),
        "class": a.class_num,
        "section": a.section,
        "subject": a.subject,
        "teacherId": a.teacher_id,
        "academicYear": a.academic_year,
        "day": a.day,
        "periodNumber": period_number,
        "timeSlot": {
            "startTime": a.start_time,
            "endTime": a.end_time
        }
    })
}

fn submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_ref = parse_class_ref(&get_required_str(params, "classId")?)?;
    let subject = get_required_str(params, "subject")?.trim().to_string();
    if subject.is_empty() {
        return Err(HandlerErr::new("bad_params", "subject must not be empty"));
    }
    let teacher_id = get_required_str(params, "teacherId")?;
    let day = get_required_str(params, "day")?;
    require_school_day(&day)?;
    let (start_time, end_time, period_number) = parse_slot(params)?;
    let academic_year = academic_year_or_default(params);

    require_staff(conn, &teacher_id)?;
    check_subject_exclusivity(conn, &teacher_id, &subject, &academic_year, &class_ref)?;

    // Service-level admission check. The storage layer repeats it inside
    // upsert_assignment, so neither layer can be bypassed alone.
    let mut stmt = conn
        .prepare(
            "SELECT start_time, end_time FROM staff_assignments
             WHERE teacher_id = ? AND day = ? AND academic_year = ?
               AND NOT (class_num = ? AND section = ? AND start_time = ? AND end_time = ?)",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let spans = stmt
        .query_map(
            (
                &teacher_id,
                &day,
                &academic_year,
                class_ref.class_num,
                &class_ref.section,
                &start_time,
                &end_time,
            ),
            |r| {
                Ok(SlotSpan::new(
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let candidate = SlotSpan::new(start_time.clone(), end_time.clone());
    schedule::check_teacher_day(&spans, &candidate)
        .map_err(|c| HandlerErr::new(c.code(), c.message()))?;

    let input = AssignmentInput {
        class_num: class_ref.class_num,
        section: class_ref.section.clone(),
        subject,
        teacher_id,
        academic_year,
        day,
        start_time,
        end_time,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let id = db::upsert_assignment(&tx, &input).map_err(map_write_err)?;
    db::mirror_assignment(&tx, &input)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "assignment": assignment_json(&id, &input, period_number) }))
}

fn row_to_assignment(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let class_num: i64 = r.get(1)?;
    let section: String = r.get(2)?;
    let subject: String = r.get(3)?;
    let teacher_id: String = r.get(4)?;
    let teacher_name: String = r.get(5)?;
    let academic_year: String = r.get(6)?;
    let day: String = r.get(7)?;
    let start_time: String = r.get(8)?;
    let end_time: String = r.get(9)?;
    Ok(json!({
        "id": id,
        "classId": format!("{}-{}", class_num, section),
        "class": class_num,
        "section": section,
        "subject": subject,
        "teacher": { "id": teacher_id, "name": teacher_name },
        "academicYear": academic_year,
        "day": day,
        "timeSlot": { "startTime": start_time, "endTime": end_time }
    }))
}

const ASSIGNMENT_COLUMNS: &str = "a.id, a.class_num, a.section, a.subject, a.teacher_id,
    u.name, a.academic_year, a.day, a.start_time, a.end_time";

fn list_for_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_ref = parse_class_ref(&get_required_str(params, "classId")?)?;
    let academic_year = academic_year_or_default(params);
    let day = params
        .get("day")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(d) = day.as_deref() {
        require_school_day(d)?;
    }

    let sql = format!(
        "SELECT {} FROM staff_assignments a
         JOIN users u ON u.id = a.teacher_id
         WHERE a.class_num = ? AND a.section = ? AND a.academic_year = ?
           AND (? IS NULL OR a.day = ?)
         ORDER BY a.day, a.start_time",
        ASSIGNMENT_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map(
            (
                class_ref.class_num,
                &class_ref.section,
                &academic_year,
                &day,
                &day,
            ),
            |r| row_to_assignment(r),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "assignments": rows }))
}

fn list_for_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let academic_year = academic_year_or_default(params);

    let sql = format!(
        "SELECT {} FROM staff_assignments a
         JOIN users u ON u.id = a.teacher_id
         WHERE a.teacher_id = ? AND a.academic_year = ?
         ORDER BY a.day, a.start_time",
        ASSIGNMENT_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((&teacher_id, &academic_year), |r| row_to_assignment(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "assignments": rows }))
}

fn remove(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "assignmentId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let deleted = db::delete_assignment(&tx, &id)
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    let Some(deleted) = deleted else {
        return Err(HandlerErr::new("not_found", "assignment not found"));
    };
    db::remove_mirrored_period(&tx, &deleted)
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
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
        "staffAssignments.submit" => Some(with_conn(state, req, submit)),
        "staffAssignments.listForClass" => Some(with_conn(state, req, list_for_class)),
        "staffAssignments.listForTeacher" => Some(with_conn(state, req, list_for_teacher)),
        "staffAssignments.remove" => Some(with_conn(state, req, remove)),
        _ => None,
    }
}
