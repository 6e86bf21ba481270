use crate::import::ImportResult;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    // One row per grade identity; the UNIQUE constraint is what keeps two
    // concurrent import jobs from double-creating.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            period_key TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            month INTEGER NOT NULL,
            year INTEGER NOT NULL,
            value REAL NOT NULL,
            comment TEXT,
            recorded_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, course_id, semester_id, period_key)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject ON grades(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_runs(
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            source_sha256 TEXT NOT NULL,
            recorded_by TEXT,
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            unmatched_sheets INTEGER NOT NULL,
            error_count INTEGER NOT NULL,
            errors_json TEXT NOT NULL,
            matched_subjects_json TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, raw),
    )?;
    Ok(())
}

pub struct SubjectRow {
    pub id: String,
    pub name: String,
}

pub fn subjects_list(conn: &Connection) -> anyhow::Result<Vec<SubjectRow>> {
    let mut stmt = conn.prepare("SELECT id, name FROM subjects ORDER BY name")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(SubjectRow {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Inserts the subject, or renames it when the id already exists.
pub fn subject_upsert(conn: &Connection, id: &str, name: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO subjects(id, name) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        (id, name),
    )?;
    Ok(())
}

pub struct ImportRunRecord<'a> {
    pub source: &'a str,
    pub source_sha256: &'a str,
    pub recorded_by: Option<&'a str>,
    pub result: &'a ImportResult,
    pub started_at: &'a str,
    pub finished_at: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRunRow {
    pub id: String,
    pub source: String,
    pub source_sha256: String,
    pub recorded_by: Option<String>,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
    pub unmatched_sheets: i64,
    pub error_count: i64,
    pub errors: Vec<String>,
    pub matched_subjects: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}

pub fn import_run_insert(conn: &Connection, run: &ImportRunRecord<'_>) -> anyhow::Result<String> {
    let id = Uuid::new_v4().to_string();
    let r = run.result;
    conn.execute(
        "INSERT INTO import_runs(
            id, source, source_sha256, recorded_by, created, updated, skipped, failed,
            unmatched_sheets, error_count, errors_json, matched_subjects_json,
            started_at, finished_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            run.source,
            run.source_sha256,
            run.recorded_by,
            r.created as i64,
            r.updated as i64,
            r.skipped as i64,
            r.failed as i64,
            r.unmatched_sheets as i64,
            r.error_count as i64,
            serde_json::to_string(&r.errors)?,
            serde_json::to_string(&r.matched_subjects)?,
            run.started_at,
            run.finished_at,
        ],
    )?;
    Ok(id)
}

/// Newest first.
pub fn import_runs_list(conn: &Connection, limit: i64) -> anyhow::Result<Vec<ImportRunRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, source, source_sha256, recorded_by, created, updated, skipped, failed,
                unmatched_sheets, error_count, errors_json, matched_subjects_json,
                started_at, finished_at
         FROM import_runs
         ORDER BY started_at DESC, rowid DESC
         LIMIT ?",
    )?;
    let raw = stmt
        .query_map([limit], |r| {
            Ok((
                ImportRunRow {
                    id: r.get(0)?,
                    source: r.get(1)?,
                    source_sha256: r.get(2)?,
                    recorded_by: r.get(3)?,
                    created: r.get(4)?,
                    updated: r.get(5)?,
                    skipped: r.get(6)?,
                    failed: r.get(7)?,
                    unmatched_sheets: r.get(8)?,
                    error_count: r.get(9)?,
                    errors: Vec::new(),
                    matched_subjects: Vec::new(),
                    started_at: r.get(12)?,
                    finished_at: r.get(13)?,
                },
                r.get::<_, String>(10)?,
                r.get::<_, String>(11)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(raw.len());
    for (mut row, errors_json, subjects_json) in raw {
        row.errors = serde_json::from_str(&errors_json)?;
        row.matched_subjects = serde_json::from_str(&subjects_json)?;
        out.push(row);
    }
    Ok(out)
}
