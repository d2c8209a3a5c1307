use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Deserialize;

/// One line of input: `{"id", "method", "params"}`.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The open workspace, if any. Teacher identity travels with each request.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn open(&mut self, path: &Path, conn: Connection) {
        self.workspace = Some(path.to_path_buf());
        self.db = Some(conn);
    }
}
