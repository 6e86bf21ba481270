use crate::db;
use crate::ipc::error::{err, no_workspace, ok};
use crate::ipc::helpers::HandlerErr;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

const SUBJECT_NAME_MAX_LEN: usize = 200;

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    match db::subjects_list(conn) {
        Ok(rows) => {
            let subjects: Vec<_> = rows
                .into_iter()
                .map(|s| json!({ "id": s.id, "name": s.name }))
                .collect();
            ok(&req.id, json!({ "subjects": subjects }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn parse_subject_entries(params: &serde_json::Value) -> Result<Vec<(String, String)>, HandlerErr> {
    let Some(arr) = params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing subjects[]"));
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, entry) in arr.iter().enumerate() {
        // Names are kept verbatim: the resolver's trimmed tier depends on it.
        let name = entry
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("subjects[{}].name is required", i),
                details: Some(json!({ "index": i })),
            })?;
        if name.len() > SUBJECT_NAME_MAX_LEN {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("subjects[{}].name length must be <= {}", i, SUBJECT_NAME_MAX_LEN),
                details: Some(json!({ "index": i })),
            });
        }
        let id = entry
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        out.push((id, name.to_string()));
    }
    Ok(out)
}

fn handle_subjects_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let entries = match parse_subject_entries(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (id, name) in &entries {
        if let Err(e) = db::subject_upsert(&tx, id, name) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "id": id, "name": name })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let subjects: Vec<_> = entries
        .into_iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();
    ok(&req.id, json!({ "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.upsert" => Some(handle_subjects_upsert(state, req)),
        _ => None,
    }
}
