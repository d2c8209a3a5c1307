use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{respond, str_param, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn health(state: &mut AppState, _req: &Request) -> HandlerResult {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
    }))
}

fn workspace_select(state: &mut AppState, req: &Request) -> HandlerResult {
    let path = PathBuf::from(str_param(req, "path")?);
    let conn = db::open_db(&path).map_err(|e| HandlerErr::new("db_open_failed", format!("{e:?}")))?;
    tracing::info!(workspace = %path.display(), "workspace selected");
    state.open(&path, conn);
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "health" => health(state, req),
        "workspace.select" => workspace_select(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
