use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::Connection;
use serde::de::DeserializeOwned;

pub type HandlerResult = Result<serde_json::Value, HandlerErr>;

pub fn respond(req: &Request, result: HandlerResult) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::debug!(method = %req.method, code = e.code, message = %e.message, "request failed");
            e.response(&req.id)
        }
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Required non-empty string param, trimmed.
pub fn str_param(req: &Request, key: &str) -> Result<String, HandlerErr> {
    opt_str_param(req, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn opt_str_param(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Database handle plus a verified `teacherId`.
pub fn teacher_scope<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<(&'a Connection, String), HandlerErr> {
    let conn = require_db(state)?;
    let teacher_id = str_param(req, "teacherId")?;
    store::require_teacher(conn, &teacher_id)?;
    Ok((conn, teacher_id))
}

/// Deserializes the whole params object into a typed struct.
pub fn parse_params<T: DeserializeOwned>(req: &Request) -> Result<T, HandlerErr> {
    serde_json::from_value(req.params.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid params: {}", e)))
}
