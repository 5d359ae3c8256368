use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::schedule::{self, SlotConflict, SlotSpan};

pub const DB_FILE: &str = "timetable.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            subject TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    // Existing workspaces may have a users table without the taught-subject
    // column. Add it if needed.
    ensure_users_subject(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff_assignments(
            id TEXT PRIMARY KEY,
            class_num INTEGER NOT NULL,
            section TEXT NOT NULL,
            subject TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            day TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            UNIQUE(class_num, section, subject, day, start_time, end_time, academic_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staff_assignments_teacher_day
         ON staff_assignments(teacher_id, day, academic_year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staff_assignments_class
         ON staff_assignments(class_num, section, academic_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            id TEXT PRIMARY KEY,
            class_num INTEGER NOT NULL,
            section TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            first_period_teacher TEXT,
            FOREIGN KEY(first_period_teacher) REFERENCES users(id),
            UNIQUE(class_num, section, academic_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_periods(
            id TEXT PRIMARY KEY,
            timetable_id TEXT NOT NULL,
            day TEXT NOT NULL,
            period_number INTEGER NOT NULL,
            subject TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            FOREIGN KEY(timetable_id) REFERENCES timetables(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            UNIQUE(timetable_id, day, period_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_periods_timetable
         ON timetable_periods(timetable_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_periods_teacher_day
         ON timetable_periods(teacher_id, day)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_days(
            id TEXT PRIMARY KEY,
            class_num INTEGER NOT NULL,
            section TEXT NOT NULL,
            date TEXT NOT NULL,
            marked_by TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(marked_by) REFERENCES users(id),
            UNIQUE(class_num, section, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_entries(
            attendance_day_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(attendance_day_id, student_id),
            FOREIGN KEY(attendance_day_id) REFERENCES attendance_days(id),
            FOREIGN KEY(student_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_days_class
         ON attendance_days(class_num, section)",
        [],
    )?;

    Ok(conn)
}

fn ensure_users_subject(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "subject")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE users ADD COLUMN subject TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One proposed or stored assignment, as the write helpers see it.
#[derive(Debug, Clone)]
pub struct AssignmentInput {
    pub class_num: i64,
    pub section: String,
    pub subject: String,
    pub teacher_id: String,
    pub academic_year: String,
    pub day: String,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug)]
pub enum AssignmentWriteError {
    Conflict(SlotConflict),
    DuplicateSlot,
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for AssignmentWriteError {
    fn from(e: rusqlite::Error) -> Self {
        AssignmentWriteError::Db(e)
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// The teacher's other slots that day/year, excluding the row being replaced.
fn teacher_day_spans(
    conn: &Connection,
    teacher_id: &str,
    day: &str,
    academic_year: &str,
    exclude_id: Option<&str>,
) -> Result<Vec<SlotSpan>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT start_time, end_time
         FROM staff_assignments
         WHERE teacher_id = ? AND day = ? AND academic_year = ? AND id != ?",
    )?;
    stmt.query_map(
        (teacher_id, day, academic_year, exclude_id.unwrap_or("")),
        |r| {
            Ok(SlotSpan::new(
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
            ))
        },
    )
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

/// Slot-keyed upsert with the admission check run at the storage layer.
///
/// The lookup key is (class, section, day, slot, year): a row already
/// holding that slot gets its subject and teacher replaced instead of a
/// second row appearing. The check runs here for every write path, so the
/// daily-load and adjacency rules hold even when a caller skips its own
/// pre-check. Run inside the caller's transaction.
pub fn upsert_assignment(
    conn: &Connection,
    a: &AssignmentInput,
) -> Result<String, AssignmentWriteError> {
    let existing_id: Option<String> = conn
        .query_row(
            "SELECT id FROM staff_assignments
             WHERE class_num = ? AND section = ? AND day = ?
               AND start_time = ? AND end_time = ? AND academic_year = ?",
            (
                a.class_num,
                &a.section,
                &a.day,
                &a.start_time,
                &a.end_time,
                &a.academic_year,
            ),
            |r| r.get(0),
        )
        .optional()?;

    let spans = teacher_day_spans(
        conn,
        &a.teacher_id,
        &a.day,
        &a.academic_year,
        existing_id.as_deref(),
    )?;
    let candidate = SlotSpan::new(a.start_time.clone(), a.end_time.clone());
    schedule::check_teacher_day(&spans, &candidate).map_err(AssignmentWriteError::Conflict)?;

    if let Some(id) = existing_id {
        conn.execute(
            "UPDATE staff_assignments SET subject = ?, teacher_id = ? WHERE id = ?",
            (&a.subject, &a.teacher_id, &id),
        )?;
        return Ok(id);
    }

    let id = uuid::Uuid::new_v4().to_string();
    let inserted = conn.execute(
        "INSERT INTO staff_assignments(
            id, class_num, section, subject, teacher_id, academic_year,
            day, start_time, end_time)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            a.class_num,
            &a.section,
            &a.subject,
            &a.teacher_id,
            &a.academic_year,
            &a.day,
            &a.start_time,
            &a.end_time,
        ),
    );
    match inserted {
        Ok(_) => Ok(id),
        Err(e) if is_unique_violation(&e) => Err(AssignmentWriteError::DuplicateSlot),
        Err(e) => Err(AssignmentWriteError::Db(e)),
    }
}

/// A deleted assignment row, kept so callers can clean up the mirror.
#[derive(Debug, Clone)]
pub struct DeletedAssignment {
    pub class_num: i64,
    pub section: String,
    pub subject: String,
    pub teacher_id: String,
    pub academic_year: String,
    pub day: String,
    pub start_time: String,
}

pub fn delete_assignment(
    conn: &Connection,
    id: &str,
) -> Result<Option<DeletedAssignment>, rusqlite::Error> {
    let row: Option<DeletedAssignment> = conn
        .query_row(
            "SELECT class_num, section, subject, teacher_id, academic_year, day, start_time
             FROM staff_assignments WHERE id = ?",
            [id],
            |r| {
                Ok(DeletedAssignment {
                    class_num: r.get(0)?,
                    section: r.get(1)?,
                    subject: r.get(2)?,
                    teacher_id: r.get(3)?,
                    academic_year: r.get(4)?,
                    day: r.get(5)?,
                    start_time: r.get(6)?,
                })
            },
        )
        .optional()?;

    if row.is_some() {
        conn.execute("DELETE FROM staff_assignments WHERE id = ?", [id])?;
    }
    Ok(row)
}

/// Find or create the projection record for a class-section-year.
pub fn ensure_timetable(
    conn: &Connection,
    class_num: i64,
    section: &str,
    academic_year: &str,
) -> Result<String, rusqlite::Error> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM timetables
             WHERE class_num = ? AND section = ? AND academic_year = ?",
            (class_num, section, academic_year),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO timetables(id, class_num, section, academic_year)
         VALUES(?, ?, ?, ?)",
        (&id, class_num, section, academic_year),
    )?;
    Ok(id)
}

/// Replace the period at (timetable, day, period number), keeping its id
/// stable across overwrites. Returns the period row id.
pub fn upsert_period(
    conn: &Connection,
    timetable_id: &str,
    day: &str,
    period_number: u8,
    subject: &str,
    teacher_id: &str,
    start_time: &str,
    end_time: &str,
) -> Result<String, rusqlite::Error> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM timetable_periods
             WHERE timetable_id = ? AND day = ? AND period_number = ?",
            (timetable_id, day, period_number as i64),
            |r| r.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE timetable_periods
             SET subject = ?, teacher_id = ?, start_time = ?, end_time = ?
             WHERE id = ?",
            (subject, teacher_id, start_time, end_time, &id),
        )?;
        return Ok(id);
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO timetable_periods(
            id, timetable_id, day, period_number, subject, teacher_id,
            start_time, end_time)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            timetable_id,
            day,
            period_number as i64,
            subject,
            teacher_id,
            start_time,
            end_time,
        ),
    )?;
    Ok(id)
}

/// Mirror one stored assignment into the projection. The period number is
/// derived from the slot start; callers validate the slot before this point.
pub fn mirror_assignment(conn: &Connection, a: &AssignmentInput) -> Result<(), rusqlite::Error> {
    let Some(period_number) = schedule::period_number_for(&a.start_time) else {
        // Unmapped starts are rejected upstream and never reach the mirror.
        return Ok(());
    };
    let timetable_id = ensure_timetable(conn, a.class_num, &a.section, &a.academic_year)?;
    upsert_period(
        conn,
        &timetable_id,
        &a.day,
        period_number,
        &a.subject,
        &a.teacher_id,
        &a.start_time,
        &a.end_time,
    )?;
    Ok(())
}

/// Drop the mirrored period for a deleted assignment, if the projection
/// still shows that assignment's subject and teacher at the derived slot.
pub fn remove_mirrored_period(
    conn: &Connection,
    deleted: &DeletedAssignment,
) -> Result<(), rusqlite::Error> {
    let Some(period_number) = schedule::period_number_for(&deleted.start_time) else {
        return Ok(());
    };
    conn.execute(
        "DELETE FROM timetable_periods
         WHERE period_number = ? AND day = ? AND subject = ? AND teacher_id = ?
           AND timetable_id IN (
             SELECT id FROM timetables
             WHERE class_num = ? AND section = ? AND academic_year = ?
           )",
        (
            period_number as i64,
            &deleted.day,
            &deleted.subject,
            &deleted.teacher_id,
            deleted.class_num,
            &deleted.section,
            &deleted.academic_year,
        ),
    )?;
    Ok(())
}

/// Number of periods the teacher holds that day across every class in the
/// year. Computed from live projection rows, never cached.
pub fn teacher_day_period_count(
    conn: &Connection,
    teacher_id: &str,
    day: &str,
    academic_year: &str,
) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*)
         FROM timetable_periods p
         JOIN timetables t ON t.id = p.timetable_id
         WHERE p.teacher_id = ? AND p.day = ? AND t.academic_year = ?",
        (teacher_id, day, academic_year),
        |r| r.get(0),
    )
}
