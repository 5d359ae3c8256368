use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;

pub const SECTIONS: [&str; 5] = ["A", "B", "C", "D", "E"];

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

/// A class-section pair parsed from a "<class>-<section>" id like "5-A".
#[derive(Debug, Clone)]
pub struct ClassRef {
    pub class_num: i64,
    pub section: String,
}

impl ClassRef {
    pub fn label(&self) -> String {
        format!("{}-{}", self.class_num, self.section)
    }
}

pub fn parse_class_ref(raw: &str) -> Result<ClassRef, HandlerErr> {
    let Some((num_part, section_part)) = raw.split_once('-') else {
        return Err(HandlerErr {
            code: "invalid_class_id",
            message: "classId must look like <class>-<section>, e.g. 5-A".to_string(),
            details: Some(json!({ "classId": raw })),
        });
    };
    let class_num: i64 = num_part.trim().parse().map_err(|_| HandlerErr {
        code: "invalid_class_id",
        message: "class must be a number between 1 and 12".to_string(),
        details: Some(json!({ "classId": raw })),
    })?;
    if !(1..=12).contains(&class_num) {
        return Err(HandlerErr {
            code: "invalid_class_id",
            message: "class must be a number between 1 and 12".to_string(),
            details: Some(json!({ "classId": raw })),
        });
    }
    let section = section_part.trim().to_ascii_uppercase();
    if !SECTIONS.contains(&section.as_str()) {
        return Err(HandlerErr {
            code: "invalid_class_id",
            message: "section must be one of A, B, C, D, E".to_string(),
            details: Some(json!({ "classId": raw })),
        });
    }
    Ok(ClassRef { class_num, section })
}

/// Accepts either a composite classId ("5-A") or a bare class number with a
/// separate section param, as the HTTP surface did.
pub fn class_ref_from_params(params: &serde_json::Value) -> Result<ClassRef, HandlerErr> {
    let raw = get_required_str(params, "classId")?;
    if raw.contains('-') {
        return parse_class_ref(&raw);
    }
    let section = get_required_str(params, "section")?;
    parse_class_ref(&format!("{}-{}", raw.trim(), section.trim()))
}

/// The academic year partition; defaults to the current calendar year.
pub fn academic_year_or_default(params: &serde_json::Value) -> String {
    params
        .get("academicYear")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            use chrono::Datelike;
            chrono::Local::now().year().to_string()
        })
}

/// Look up a user expected to be a staff member; returns their name.
pub fn require_staff(conn: &Connection, teacher_id: &str) -> Result<String, HandlerErr> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT name, role FROM users WHERE id = ?",
            [teacher_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    match row {
        Some((name, role)) if role == "staff" => Ok(name),
        _ => Err(HandlerErr {
            code: "teacher_not_found",
            message: "invalid teacher selected".to_string(),
            details: Some(json!({ "teacherId": teacher_id })),
        }),
    }
}
