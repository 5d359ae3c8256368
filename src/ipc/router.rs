use rusqlite::OptionalExtension;

use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Daemon plumbing and collaborator seams; no actor needed.
    Open,
    /// Any user known to the directory.
    Session,
    /// Admin role only.
    Admin,
}

/// Role requirements live here, ahead of dispatch, instead of being
/// re-checked inside each handler. Unlisted methods stay Open so unknown
/// method names still fall through to not_implemented.
fn gate_for(method: &str) -> Gate {
    match method {
        "staffAssignments.submit"
        | "staffAssignments.remove"
        | "staffAssignments.listForClass"
        | "staffAssignments.listForTeacher"
        | "timetable.replaceDay"
        | "timetable.periodUpdate"
        | "timetable.periodDelete" => Gate::Admin,
        "timetable.classGet"
        | "timetable.periodGet"
        | "timetable.canAssignTeacher"
        | "timetable.isTeacherAssigned"
        | "directory.teachers"
        | "attendance.markDay"
        | "attendance.listForClass" => Gate::Session,
        _ => Gate::Open,
    }
}

/// Resolve the caller's role once. attendance.markDay narrows further to
/// the class's first-period teacher inside its handler.
fn authorize(state: &AppState, req: &Request) -> Option<serde_json::Value> {
    let gate = gate_for(&req.method);
    if gate == Gate::Open {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let Some(actor_id) = req.params.get("actorId").and_then(|v| v.as_str()) else {
        return Some(err(&req.id, "unauthorized", "missing params.actorId", None));
    };
    let role: Option<String> = match conn
        .query_row("SELECT role FROM users WHERE id = ?", [actor_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return Some(err(&req.id, "db_query_failed", e.to_string(), None)),
    };
    let Some(role) = role else {
        return Some(err(&req.id, "unauthorized", "unknown actor", None));
    };
    if gate == Gate::Admin && role != "admin" {
        return Some(err(&req.id, "forbidden", "admin role required", None));
    }
    None
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    if let Some(resp) = authorize(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::directory::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::assignments::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::timetable::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::attendance::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::backup_exchange::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
