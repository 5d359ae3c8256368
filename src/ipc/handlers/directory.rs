use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

const ROLES: [&str; 3] = ["admin", "staff", "student"];

/// The user-directory seam. The daemon only keeps identity and role; the
/// surrounding application owns registration, passwords, and sessions.
fn handle_directory_upsert_user(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let role = match req.params.get("role").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_ascii_lowercase(),
        None => return err(&req.id, "bad_params", "missing role", None),
    };
    if !ROLES.contains(&role.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "role must be one of: admin, staff, student",
            Some(json!({ "role": role })),
        );
    }
    let subject = req
        .params
        .get("subject")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let user_id = req
        .params
        .get("userId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Err(e) = conn.execute(
        "INSERT INTO users(id, name, role, subject)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           role = excluded.role,
           subject = excluded.subject",
        (&user_id, &name, &role, &subject),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(
        &req.id,
        json!({ "userId": user_id, "name": name, "role": role }),
    )
}

fn handle_directory_teachers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, subject FROM users WHERE role = 'staff' ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let subject: Option<String> = row.get(2)?;
            Ok(json!({
                "id": id,
                "name": name,
                "subject": subject
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "directory.upsertUser" => Some(handle_directory_upsert_user(state, req)),
        "directory.teachers" => Some(handle_directory_teachers(state, req)),
        _ => None,
    }
}
