use crate::db::{self, AssignmentInput};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::assignments::{check_subject_exclusivity, map_write_err};
use crate::ipc::helpers::{
    academic_year_or_default, class_ref_from_params, get_required_str, require_staff, ClassRef,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

fn find_timetable(
    conn: &Connection,
    class_ref: &ClassRef,
    academic_year: &str,
) -> Result<Option<(String, Option<String>)>, HandlerErr> {
    conn.query_row(
        "SELECT id, first_period_teacher FROM timetables
         WHERE class_num = ? AND section = ? AND academic_year = ?",
        (class_ref.class_num, &class_ref.section, academic_year),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn period_json(
    id: &str,
    period_number: i64,
    subject: &str,
    teacher_id: &str,
    teacher_name: &str,
    start_time: &str,
    end_time: &str,
) -> serde_json::Value {
    json!({
        "id": id,
        "periodNumber": period_number,
        "subject": subject,
        "teacher": { "id": teacher_id, "name": teacher_name },
        "startTime": start_time,
        "endTime": end_time
    })
}

fn day_periods(
    conn: &Connection,
    timetable_id: &str,
    day: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.period_number, p.subject, p.teacher_id, u.name,
                    p.start_time, p.end_time
             FROM timetable_periods p
             JOIN users u ON u.id = p.teacher_id
             WHERE p.timetable_id = ? AND p.day = ?
             ORDER BY p.period_number",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map((timetable_id, day), |r| {
        let id: String = r.get(0)?;
        let period_number: i64 = r.get(1)?;
        let subject: String = r.get(2)?;
        let teacher_id: String = r.get(3)?;
        let teacher_name: String = r.get(4)?;
        let start_time: String = r.get(5)?;
        let end_time: String = r.get(6)?;
        Ok(period_json(
            &id,
            period_number,
            &subject,
            &teacher_id,
            &teacher_name,
            &start_time,
            &end_time,
        ))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn class_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_ref = class_ref_from_params(params)?;
    let academic_year = academic_year_or_default(params);

    let Some((timetable_id, first_period_teacher)) =
        find_timetable(conn, &class_ref, &academic_year)?
    else {
        return Err(HandlerErr::new("not_found", "timetable not found"));
    };

    let mut days = Vec::new();
    for day in schedule::DAYS {
        let periods = day_periods(conn, &timetable_id, day)?;
        if !periods.is_empty() {
            days.push(json!({ "day": day, "periods": periods }));
        }
    }

    // Per-teacher day loads, recomputed from the live period rows.
    let mut stmt = conn
        .prepare(
            "SELECT p.teacher_id, u.name, p.day, COUNT(*)
             FROM timetable_periods p
             JOIN users u ON u.id = p.teacher_id
             WHERE p.timetable_id = ?
             GROUP BY p.teacher_id, p.day
             ORDER BY u.name, p.day",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let teacher_daily_classes = stmt
        .query_map([&timetable_id], |r| {
            let teacher_id: String = r.get(0)?;
            let teacher_name: String = r.get(1)?;
            let day: String = r.get(2)?;
            let class_count: i64 = r.get(3)?;
            Ok(json!({
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "day": day,
                "classCount": class_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let first_period_teacher_json = match first_period_teacher {
        Some(fpt_id) => {
            let name: Option<String> = conn
                .query_row("SELECT name FROM users WHERE id = ?", [&fpt_id], |r| {
                    r.get(0)
                })
                .optional()
                .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
            json!({ "id": fpt_id, "name": name })
        }
        None => serde_json::Value::Null,
    };

    Ok(json!({
        "timetable": {
            "id": timetable_id,
            "classId": class_ref.label(),
            "class": class_ref.class_num,
            "section": class_ref.section,
            "academicYear": academic_year,
            "firstPeriodTeacher": first_period_teacher_json,
            "days": days,
            "teacherDailyClasses": teacher_daily_classes
        }
    }))
}

struct PeriodRow {
    timetable_id: String,
    day: String,
    period_number: i64,
    start_time: String,
    end_time: String,
    class_num: i64,
    section: String,
    academic_year: String,
}

fn load_period(conn: &Connection, period_id: &str) -> Result<Option<PeriodRow>, HandlerErr> {
    conn.query_row(
        "SELECT p.timetable_id, p.day, p.period_number, p.start_time, p.end_time,
                t.class_num, t.section, t.academic_year
         FROM timetable_periods p
         JOIN timetables t ON t.id = p.timetable_id
         WHERE p.id = ?",
        [period_id],
        |r| {
            Ok(PeriodRow {
                timetable_id: r.get(0)?,
                day: r.get(1)?,
                period_number: r.get(2)?,
                start_time: r.get(3)?,
                end_time: r.get(4)?,
                class_num: r.get(5)?,
                section: r.get(6)?,
                academic_year: r.get(7)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn period_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let period_id = get_required_str(params, "periodId")?;
    let found = conn
        .query_row(
            "SELECT p.id, p.day, p.period_number, p.subject, p.teacher_id, u.name,
                    p.start_time, p.end_time, t.class_num, t.section, t.academic_year
             FROM timetable_periods p
             JOIN timetables t ON t.id = p.timetable_id
             JOIN users u ON u.id = p.teacher_id
             WHERE p.id = ?",
            [&period_id],
            |r| {
                let id: String = r.get(0)?;
                let day: String = r.get(1)?;
                let period_number: i64 = r.get(2)?;
                let subject: String = r.get(3)?;
                let teacher_id: String = r.get(4)?;
                let teacher_name: String = r.get(5)?;
                let start_time: String = r.get(6)?;
                let end_time: String = r.get(7)?;
                let class_num: i64 = r.get(8)?;
                let section: String = r.get(9)?;
                let academic_year: String = r.get(10)?;
                let mut period = period_json(
                    &id,
                    period_number,
                    &subject,
                    &teacher_id,
                    &teacher_name,
                    &start_time,
                    &end_time,
                );
                period["day"] = json!(day);
                period["classId"] = json!(format!("{}-{}", class_num, section));
                period["academicYear"] = json!(academic_year);
                Ok(period)
            },
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    match found {
        Some(period) => Ok(json!({ "period": period })),
        None => Err(HandlerErr::new("not_found", "period not found")),
    }
}

struct NewPeriod {
    subject: String,
    teacher_id: String,
    start_time: String,
    end_time: String,
    period_number: u8,
}

fn parse_new_period(idx: usize, item: &serde_json::Value) -> Result<NewPeriod, HandlerErr> {
    let subject = item
        .get("subject")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            HandlerErr::new("bad_params", format!("periods[{}] missing subject", idx))
        })?;
    let teacher_id = item
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            HandlerErr::new("bad_params", format!("periods[{}] missing teacherId", idx))
        })?;
    let start_time = item
        .get("startTime")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| {
            HandlerErr::new("bad_params", format!("periods[{}] missing startTime", idx))
        })?;
    let end_time = item
        .get("endTime")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| {
            HandlerErr::new("bad_params", format!("periods[{}] missing endTime", idx))
        })?;
    if !schedule::is_canonical_slot(&start_time, &end_time) {
        return Err(HandlerErr {
            code: "unknown_time_slot",
            message: format!(
                "periods[{}] does not match the school period calendar",
                idx
            ),
            details: Some(json!({ "startTime": start_time, "endTime": end_time })),
        });
    }
    let Some(period_number) = schedule::period_number_for(&start_time) else {
        return Err(HandlerErr {
            code: "unknown_time_slot",
            message: format!(
                "periods[{}] does not match the school period calendar",
                idx
            ),
            details: Some(json!({ "startTime": start_time, "endTime": end_time })),
        });
    };
    Ok(NewPeriod {
        subject,
        teacher_id,
        start_time,
        end_time,
        period_number,
    })
}

/// Wholesale replacement of one day's schedule for a class-section-year.
/// The day's assignments are rewritten alongside the projection so both
/// representations stay in step, and every new period passes the same
/// admission checks as a single submit.
fn replace_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_ref = class_ref_from_params(params)?;
    let academic_year = academic_year_or_default(params);
    let day = get_required_str(params, "day")?;
    require_school_day(&day)?;
    let Some(items) = params.get("periods").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing periods"));
    };
    let first_period_teacher = params
        .get("firstPeriodTeacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());

    let mut new_periods: Vec<NewPeriod> = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let p = parse_new_period(idx, item)?;
        if new_periods
            .iter()
            .any(|q| q.period_number == p.period_number)
        {
            return Err(HandlerErr::new(
                "bad_params",
                format!("periods[{}] repeats period {}", idx, p.period_number),
            ));
        }
        require_staff(conn, &p.teacher_id)?;
        new_periods.push(p);
    }
    if let Some(fpt) = first_period_teacher.as_deref() {
        if let Err(mut e) = require_staff(conn, fpt) {
            if e.code == "teacher_not_found" {
                e.message = "first period teacher not found".to_string();
            }
            return Err(e);
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let timetable_id = db::ensure_timetable(
        &tx,
        class_ref.class_num,
        &class_ref.section,
        &academic_year,
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    tx.execute(
        "DELETE FROM staff_assignments
         WHERE class_num = ? AND section = ? AND day = ? AND academic_year = ?",
        (class_ref.class_num, &class_ref.section, &day, &academic_year),
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM timetable_periods WHERE timetable_id = ? AND day = ?",
        (&timetable_id, &day),
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;

    for p in &new_periods {
        check_subject_exclusivity(&tx, &p.teacher_id, &p.subject, &academic_year, &class_ref)?;
        let input = AssignmentInput {
            class_num: class_ref.class_num,
            section: class_ref.section.clone(),
            subject: p.subject.clone(),
            teacher_id: p.teacher_id.clone(),
            academic_year: academic_year.clone(),
            day: day.clone(),
            start_time: p.start_time.clone(),
            end_time: p.end_time.clone(),
        };
        db::upsert_assignment(&tx, &input).map_err(map_write_err)?;
        db::mirror_assignment(&tx, &input)
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }

    if let Some(fpt) = first_period_teacher.as_deref() {
        tx.execute(
            "UPDATE timetables SET first_period_teacher = ? WHERE id = ?",
            (fpt, &timetable_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let periods = day_periods(conn, &timetable_id, &day)?;
    Ok(json!({
        "classId": class_ref.label(),
        "academicYear": academic_year,
        "day": day,
        "periods": periods
    }))
}

fn period_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let period_id = get_required_str(params, "periodId")?;
    let subject = get_required_str(params, "subject")?.trim().to_string();
    if subject.is_empty() {
        return Err(HandlerErr::new("bad_params", "subject must not be empty"));
    }
    let teacher_id = get_required_str(params, "teacherId")?;
    let start_time = get_required_str(params, "startTime")?.trim().to_string();
    let end_time = get_required_str(params, "endTime")?.trim().to_string();
    if !schedule::is_canonical_slot(&start_time, &end_time) {
        return Err(HandlerErr {
            code: "unknown_time_slot",
            message: "time slot does not match the school period calendar".to_string(),
            details: Some(json!({ "startTime": start_time, "endTime": end_time })),
        });
    }
    let Some(new_number) = schedule::period_number_for(&start_time) else {
        return Err(HandlerErr::new(
            "unknown_time_slot",
            "time slot does not match the school period calendar",
        ));
    };

    let Some(row) = load_period(conn, &period_id)? else {
        return Err(HandlerErr::new("not_found", "period not found"));
    };
    let teacher_name = require_staff(conn, &teacher_id)?;
    let class_ref = ClassRef {
        class_num: row.class_num,
        section: row.section.clone(),
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Free the store row backing the period's old slot; the new values are
    // written through the guarded upsert below.
    tx.execute(
        "DELETE FROM staff_assignments
         WHERE class_num = ? AND section = ? AND day = ?
           AND start_time = ? AND end_time = ? AND academic_year = ?",
        (
            row.class_num,
            &row.section,
            &row.day,
            &row.start_time,
            &row.end_time,
            &row.academic_year,
        ),
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;

    if i64::from(new_number) != row.period_number {
        let occupied: Option<String> = tx
            .query_row(
                "SELECT id FROM timetable_periods
                 WHERE timetable_id = ? AND day = ? AND period_number = ? AND id != ?",
                (&row.timetable_id, &row.day, i64::from(new_number), &period_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        if occupied.is_some() {
            return Err(HandlerErr::new(
                "duplicate_slot",
                "another period already occupies this time slot",
            ));
        }
    }

    check_subject_exclusivity(&tx, &teacher_id, &subject, &row.academic_year, &class_ref)?;
    let input = AssignmentInput {
        class_num: row.class_num,
        section: row.section.clone(),
        subject: subject.clone(),
        teacher_id: teacher_id.clone(),
        academic_year: row.academic_year.clone(),
        day: row.day.clone(),
        start_time: start_time.clone(),
        end_time: end_time.clone(),
    };
    db::upsert_assignment(&tx, &input).map_err(map_write_err)?;

    tx.execute(
        "UPDATE timetable_periods
         SET period_number = ?, subject = ?, teacher_id = ?, start_time = ?, end_time = ?
         WHERE id = ?",
        (
            i64::from(new_number),
            &subject,
            &teacher_id,
            &start_time,
            &end_time,
            &period_id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let mut period = period_json(
        &period_id,
        i64::from(new_number),
        &subject,
        &teacher_id,
        &teacher_name,
        &start_time,
        &end_time,
    );
    period["day"] = json!(row.day);
    period["classId"] = json!(class_ref.label());
    period["academicYear"] = json!(row.academic_year);
    Ok(json!({ "period": period }))
}

fn period_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let period_id = get_required_str(params, "periodId")?;
    let Some(row) = load_period(conn, &period_id)? else {
        return Err(HandlerErr::new("not_found", "period not found"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM staff_assignments
         WHERE class_num = ? AND section = ? AND day = ?
           AND start_time = ? AND end_time = ? AND academic_year = ?",
        (
            row.class_num,
            &row.section,
            &row.day,
            &row.start_time,
            &row.end_time,
            &row.academic_year,
        ),
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.execute("DELETE FROM timetable_periods WHERE id = ?", [&period_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

fn can_assign_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_ref = class_ref_from_params(params)?;
    let academic_year = academic_year_or_default(params);
    let teacher_id = get_required_str(params, "teacherId")?;
    let day = get_required_str(params, "day")?;
    require_school_day(&day)?;
    let period_number = params
        .get("periodNumber")
        .and_then(|v| v.as_u64())
        .filter(|n| (1..=8).contains(n))
        .ok_or_else(|| HandlerErr::new("bad_params", "periodNumber must be between 1 and 8"))?
        as i64;

    // Day load spans every class the teacher appears in that year, not just
    // this timetable.
    let count = db::teacher_day_period_count(conn, &teacher_id, &day, &academic_year)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if count >= schedule::MAX_DAILY_PERIODS as i64 {
        return Ok(json!({ "allowed": false, "reason": "daily_limit_exceeded" }));
    }

    if let Some((timetable_id, _)) = find_timetable(conn, &class_ref, &academic_year)? {
        let adjacent: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM timetable_periods
                 WHERE timetable_id = ? AND day = ? AND teacher_id = ?
                   AND period_number IN (?, ?)",
                (
                    &timetable_id,
                    &day,
                    &teacher_id,
                    period_number - 1,
                    period_number + 1,
                ),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        if adjacent.is_some() {
            return Ok(json!({ "allowed": false, "reason": "consecutive_period_conflict" }));
        }
    }

    Ok(json!({ "allowed": true }))
}

fn is_teacher_assigned(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_ref = class_ref_from_params(params)?;
    let academic_year = academic_year_or_default(params);
    let teacher_id = get_required_str(params, "teacherId")?;
    let day = get_required_str(params, "day")?;
    require_school_day(&day)?;

    let Some((timetable_id, _)) = find_timetable(conn, &class_ref, &academic_year)? else {
        return Ok(json!({ "assigned": false }));
    };
    let assigned: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM timetable_periods
             WHERE timetable_id = ? AND day = ? AND teacher_id = ?
             LIMIT 1",
            (&timetable_id, &day, &teacher_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "assigned": assigned.is_some() }))
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
        "timetable.classGet" => Some(with_conn(state, req, class_get)),
        "timetable.periodGet" => Some(with_conn(state, req, period_get)),
        "timetable.replaceDay" => Some(with_conn(state, req, replace_day)),
        "timetable.periodUpdate" => Some(with_conn(state, req, period_update)),
        "timetable.periodDelete" => Some(with_conn(state, req, period_delete)),
        "timetable.canAssignTeacher" => Some(with_conn(state, req, can_assign_teacher)),
        "timetable.isTeacherAssigned" => Some(with_conn(state, req, is_teacher_assigned)),
        _ => None,
    }
}
