use crate::config;
use crate::db;
use crate::import::{run_import, ImportOptions, ImportResult};
use crate::ipc::error::{err, no_workspace, ok};
use crate::ipc::helpers::{get_optional_i64_range, get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::normalize::PeriodKey;
use crate::reconcile::{
    now_timestamp, GradeIdentity, GradeRecord, GradeStore, PreviewStore, SqliteGradeStore,
};
use crate::subjects::SubjectDirectory;
use crate::workbook::{read_workbook_file, Workbook};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

const GRADES_LIST_MAX: i64 = 5000;
const HISTORY_DEFAULT_LIMIT: i64 = 50;

struct LoadedWorkbook {
    workbook: Workbook,
    /// File path, or `inline` for a workbook sent in the request.
    source: String,
    sha256: String,
}

fn load_workbook(params: &Value) -> Result<LoadedWorkbook, HandlerErr> {
    if let Some(path) = get_optional_str(params, "path")? {
        let path = PathBuf::from(path);
        let bytes = std::fs::read(&path).map_err(|e| HandlerErr {
            code: "workbook_read_failed",
            message: e.to_string(),
            details: Some(json!({ "path": path.to_string_lossy() })),
        })?;
        let workbook = read_workbook_file(&path).map_err(|e| HandlerErr {
            code: "workbook_read_failed",
            message: format!("{:#}", e),
            details: Some(json!({ "path": path.to_string_lossy() })),
        })?;
        return Ok(LoadedWorkbook {
            workbook,
            source: path.to_string_lossy().to_string(),
            sha256: format!("{:x}", Sha256::digest(&bytes)),
        });
    }

    let Some(inline) = params.get("workbook").filter(|v| !v.is_null()) else {
        return Err(HandlerErr::bad_params("missing path or workbook"));
    };
    let workbook: Workbook = serde_json::from_value(inline.clone()).map_err(|e| HandlerErr {
        code: "workbook_read_failed",
        message: e.to_string(),
        details: None,
    })?;
    let bytes = serde_json::to_vec(inline).unwrap_or_default();
    Ok(LoadedWorkbook {
        workbook,
        source: "inline".to_string(),
        sha256: format!("{:x}", Sha256::digest(&bytes)),
    })
}

fn import_options<'a>(
    conn: &Connection,
    params: &Value,
    recorded_by: Option<&'a str>,
) -> Result<ImportOptions<'a>, HandlerErr> {
    let cfg = config::load(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: format!("{:#}", e),
        details: None,
    })?;
    let layout = cfg.layout().map_err(|e| HandlerErr {
        code: "bad_config",
        message: e.to_string(),
        details: None,
    })?;
    let error_limit = get_optional_i64_range(params, "errorLimit", 1, 500)?
        .map(|n| n as usize)
        .unwrap_or(cfg.error_limit);
    Ok(ImportOptions {
        layout,
        error_limit,
        recorded_by,
    })
}

fn load_directory(conn: &Connection) -> Result<SubjectDirectory, HandlerErr> {
    SubjectDirectory::load(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "subjects" })),
    })
}

fn result_json(result: &ImportResult) -> Value {
    serde_json::to_value(result).unwrap_or_else(|_| json!({}))
}

fn handle_import_workbook(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let recorded_by = match get_optional_str(&req.params, "recordedBy") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let loaded = match load_workbook(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let options = match import_options(conn, &req.params, recorded_by.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let directory = match load_directory(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let started_at = now_timestamp();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut store = SqliteGradeStore::new(&tx);
    let result = match run_import(&loaded.workbook, &directory, &mut store, &options) {
        Ok(r) => r,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                e.code(),
                e.to_string(),
                Some(json!({ "source": loaded.source })),
            );
        }
    };

    let finished_at = now_timestamp();
    let run_id = match db::import_run_insert(
        &tx,
        &db::ImportRunRecord {
            source: &loaded.source,
            source_sha256: &loaded.sha256,
            recorded_by: recorded_by.as_deref(),
            result: &result,
            started_at: &started_at,
            finished_at: &finished_at,
        },
    ) {
        Ok(id) => id,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "import_runs" })),
            );
        }
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let mut out = result_json(&result);
    out["runId"] = json!(run_id);
    out["sourceSha256"] = json!(loaded.sha256);
    ok(&req.id, out)
}

fn handle_preview_workbook(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let recorded_by = match get_optional_str(&req.params, "recordedBy") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let loaded = match load_workbook(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let options = match import_options(conn, &req.params, recorded_by.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let directory = match load_directory(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let base = SqliteGradeStore::new(conn);
    let mut store = PreviewStore::new(&base);
    match run_import(&loaded.workbook, &directory, &mut store, &options) {
        Ok(result) => {
            let mut out = result_json(&result);
            out["preview"] = json!(true);
            ok(&req.id, out)
        }
        Err(e) => err(
            &req.id,
            e.code(),
            e.to_string(),
            Some(json!({ "source": loaded.source })),
        ),
    }
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };

    let mut clauses: Vec<&'static str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    for (param, clause) in [
        ("studentId", "student_id = ?"),
        ("subjectId", "subject_id = ?"),
        ("courseId", "course_id = ?"),
        ("semesterId", "semester_id = ?"),
        ("periodKey", "period_key = ?"),
    ] {
        match get_optional_str(&req.params, param) {
            Ok(Some(v)) => {
                clauses.push(clause);
                bind.push(SqlValue::Text(v));
            }
            Ok(None) => {}
            Err(e) => return e.response(&req.id),
        }
    }

    let mut sql = format!("SELECT {} FROM grades", GradeRecord::COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY subject_id, student_id, period_key LIMIT ?");
    bind.push(SqlValue::Integer(GRADES_LIST_MAX));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grades = match stmt
        .query_map(params_from_iter(bind), GradeRecord::from_row)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "grades": serde_json::to_value(&grades).unwrap_or_else(|_| json!([])),
        }),
    )
}

fn parse_identity(params: &Value) -> Result<GradeIdentity, HandlerErr> {
    Ok(GradeIdentity {
        student_id: get_required_str(params, "studentId")?,
        subject_id: get_required_str(params, "subjectId")?,
        course_id: get_required_str(params, "courseId")?,
        semester_id: get_required_str(params, "semesterId")?,
        period_key: PeriodKey::from_stored(get_required_str(params, "periodKey")?),
    })
}

fn handle_grade_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let identity = match parse_identity(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let store = SqliteGradeStore::new(conn);
    match store.find_grade_by_identity(&identity) {
        Ok(found) => ok(
            &req.id,
            json!({ "grade": serde_json::to_value(&found).unwrap_or(Value::Null) }),
        ),
        Err(e) => err(&req.id, "db_query_failed", format!("{:#}", e), None),
    }
}

fn handle_import_history(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let limit = match get_optional_i64_range(&req.params, "limit", 1, 500) {
        Ok(v) => v.unwrap_or(HISTORY_DEFAULT_LIMIT),
        Err(e) => return e.response(&req.id),
    };
    match db::import_runs_list(conn, limit) {
        Ok(runs) => ok(
            &req.id,
            json!({ "runs": serde_json::to_value(&runs).unwrap_or_else(|_| json!([])) }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "grades.importWorkbook" => Some(handle_import_workbook(state, req)),
        "grades.previewWorkbook" => Some(handle_preview_workbook(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.get" => Some(handle_grade_get(state, req)),
        "grades.importHistory" => Some(handle_import_history(state, req)),
        _ => None,
    }
}
