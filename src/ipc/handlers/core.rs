use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "databaseOpen": state.db.is_some(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(path) = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
    else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let conn = match db::open_db(&path) {
        Ok(c) => c,
        Err(e) => {
            return err(
                &req.id,
                "db_open_failed",
                format!("{:#}", e),
                Some(json!({ "path": path.to_string_lossy() })),
            )
        }
    };
    let subjects = match db::subjects_list(&conn) {
        Ok(rows) => rows.len(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    tracing::info!(workspace = %path.to_string_lossy(), subjects, "workspace opened");
    let workspace_path = path.to_string_lossy().to_string();
    state.workspace = Some(path);
    state.db = Some(conn);
    ok(
        &req.id,
        json!({ "workspacePath": workspace_path, "subjects": subjects }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
