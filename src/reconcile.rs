use crate::extract::RowCandidate;
use crate::normalize::PeriodKey;
use anyhow::{anyhow, Context};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Composite key: at most one grade may exist per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeIdentity {
    pub student_id: String,
    pub subject_id: String,
    pub course_id: String,
    pub semester_id: String,
    pub period_key: PeriodKey,
}

impl GradeIdentity {
    pub fn of(candidate: &RowCandidate) -> Self {
        Self {
            student_id: candidate.student_id.clone(),
            subject_id: candidate.subject_id.clone(),
            course_id: candidate.course_id.clone(),
            semester_id: candidate.semester_id.clone(),
            period_key: candidate.period_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub id: String,
    #[serde(flatten)]
    pub identity: GradeIdentity,
    pub school_year_id: String,
    pub month: u32,
    pub year: i32,
    pub value: f64,
    pub comment: Option<String>,
    pub recorded_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GradeRecord {
    pub const COLUMNS: &'static str = "id, student_id, subject_id, course_id, semester_id, period_key,
        school_year_id, month, year, value, comment, recorded_by, created_at, updated_at";

    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            identity: GradeIdentity {
                student_id: r.get(1)?,
                subject_id: r.get(2)?,
                course_id: r.get(3)?,
                semester_id: r.get(4)?,
                period_key: PeriodKey::from_stored(r.get(5)?),
            },
            school_year_id: r.get(6)?,
            month: r.get(7)?,
            year: r.get(8)?,
            value: r.get(9)?,
            comment: r.get(10)?,
            recorded_by: r.get(11)?,
            created_at: r.get(12)?,
            updated_at: r.get(13)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewGrade {
    pub identity: GradeIdentity,
    pub school_year_id: String,
    pub month: u32,
    pub year: i32,
    pub value: f64,
    pub comment: Option<String>,
    pub recorded_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Create(NewGrade),
    /// Replaces value, comment and recorder of `existing`; its identity
    /// fields stay as they are.
    Update {
        existing: GradeRecord,
        value: f64,
        comment: Option<String>,
        recorded_by: Option<String>,
    },
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Create(_) => "create",
            Decision::Update { .. } => "update",
        }
    }
}

/// The two operations the importer needs from persistence.
pub trait GradeStore {
    fn find_grade_by_identity(&self, identity: &GradeIdentity) -> anyhow::Result<Option<GradeRecord>>;
    fn upsert(&mut self, decision: &Decision) -> anyhow::Result<GradeRecord>;
}

/// Looks the candidate up by identity and decides between create and update.
pub fn reconcile<S: GradeStore + ?Sized>(
    store: &S,
    candidate: &RowCandidate,
    recorded_by: Option<&str>,
) -> anyhow::Result<Decision> {
    let identity = GradeIdentity::of(candidate);
    let recorded_by = recorded_by.map(str::to_string);
    match store.find_grade_by_identity(&identity)? {
        Some(existing) => Ok(Decision::Update {
            existing,
            value: candidate.score,
            comment: candidate.comment.clone(),
            recorded_by,
        }),
        None => Ok(Decision::Create(NewGrade {
            identity,
            school_year_id: candidate.school_year_id.clone(),
            month: candidate.month,
            year: candidate.year,
            value: candidate.score,
            comment: candidate.comment.clone(),
            recorded_by,
        })),
    }
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct SqliteGradeStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteGradeStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn get_by_id(&self, id: &str) -> anyhow::Result<GradeRecord> {
        let sql = format!("SELECT {} FROM grades WHERE id = ?", GradeRecord::COLUMNS);
        self.conn
            .query_row(&sql, [id], GradeRecord::from_row)
            .with_context(|| format!("grade {} not found after write", id))
    }
}

impl GradeStore for SqliteGradeStore<'_> {
    fn find_grade_by_identity(&self, identity: &GradeIdentity) -> anyhow::Result<Option<GradeRecord>> {
        let sql = format!(
            "SELECT {} FROM grades
             WHERE student_id = ? AND subject_id = ? AND course_id = ?
               AND semester_id = ? AND period_key = ?",
            GradeRecord::COLUMNS
        );
        let found = self
            .conn
            .query_row(
                &sql,
                (
                    &identity.student_id,
                    &identity.subject_id,
                    &identity.course_id,
                    &identity.semester_id,
                    identity.period_key.as_str(),
                ),
                GradeRecord::from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn upsert(&mut self, decision: &Decision) -> anyhow::Result<GradeRecord> {
        let now = now_timestamp();
        match decision {
            Decision::Create(g) => {
                let id = Uuid::new_v4().to_string();
                self.conn.execute(
                    "INSERT INTO grades(
                        id, student_id, subject_id, course_id, semester_id, period_key,
                        school_year_id, month, year, value, comment, recorded_by,
                        created_at, updated_at
                     ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    rusqlite::params![
                        id,
                        g.identity.student_id,
                        g.identity.subject_id,
                        g.identity.course_id,
                        g.identity.semester_id,
                        g.identity.period_key.as_str(),
                        g.school_year_id,
                        g.month,
                        g.year,
                        g.value,
                        g.comment,
                        g.recorded_by,
                        now,
                        now,
                    ],
                )?;
                self.get_by_id(&id)
            }
            Decision::Update {
                existing,
                value,
                comment,
                recorded_by,
            } => {
                let changed = self.conn.execute(
                    "UPDATE grades SET value = ?, comment = ?, recorded_by = ?, updated_at = ?
                     WHERE id = ?",
                    (value, comment, recorded_by, &now, &existing.id),
                )?;
                if changed == 0 {
                    return Err(anyhow!("grade {} no longer exists", existing.id));
                }
                self.get_by_id(&existing.id)
            }
        }
    }
}

/// Dry-run store: reads fall through to `inner`, writes stay in memory.
///
/// Later rows still see earlier rows' would-be writes, so a preview reports
/// the same create/update split a real import would.
pub struct PreviewStore<'a, S: GradeStore + ?Sized> {
    inner: &'a S,
    pending: HashMap<GradeIdentity, GradeRecord>,
}

impl<'a, S: GradeStore + ?Sized> PreviewStore<'a, S> {
    pub fn new(inner: &'a S) -> Self {
        Self {
            inner,
            pending: HashMap::new(),
        }
    }
}

impl<S: GradeStore + ?Sized> GradeStore for PreviewStore<'_, S> {
    fn find_grade_by_identity(&self, identity: &GradeIdentity) -> anyhow::Result<Option<GradeRecord>> {
        if let Some(g) = self.pending.get(identity) {
            return Ok(Some(g.clone()));
        }
        self.inner.find_grade_by_identity(identity)
    }

    fn upsert(&mut self, decision: &Decision) -> anyhow::Result<GradeRecord> {
        let record = apply_in_memory(decision, now_timestamp());
        self.pending
            .insert(record.identity.clone(), record.clone());
        Ok(record)
    }
}

fn apply_in_memory(decision: &Decision, now: String) -> GradeRecord {
    match decision {
        Decision::Create(g) => GradeRecord {
            id: Uuid::new_v4().to_string(),
            identity: g.identity.clone(),
            school_year_id: g.school_year_id.clone(),
            month: g.month,
            year: g.year,
            value: g.value,
            comment: g.comment.clone(),
            recorded_by: g.recorded_by.clone(),
            created_at: now.clone(),
            updated_at: now,
        },
        Decision::Update {
            existing,
            value,
            comment,
            recorded_by,
        } => GradeRecord {
            value: *value,
            comment: comment.clone(),
            recorded_by: recorded_by.clone(),
            updated_at: now,
            ..existing.clone()
        },
    }
}

/// In-memory store for pipeline tests. Writes for students listed in
/// `reject_students` fail like a constraint violation would.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryGradeStore {
    pub records: HashMap<GradeIdentity, GradeRecord>,
    pub reject_students: std::collections::HashSet<String>,
    pub writes: usize,
}

#[cfg(test)]
impl GradeStore for MemoryGradeStore {
    fn find_grade_by_identity(&self, identity: &GradeIdentity) -> anyhow::Result<Option<GradeRecord>> {
        Ok(self.records.get(identity).cloned())
    }

    fn upsert(&mut self, decision: &Decision) -> anyhow::Result<GradeRecord> {
        let identity = match decision {
            Decision::Create(g) => &g.identity,
            Decision::Update { existing, .. } => &existing.identity,
        };
        if self.reject_students.contains(&identity.student_id) {
            return Err(anyhow!("CHECK constraint failed: grades"));
        }
        if matches!(decision, Decision::Create(_)) && self.records.contains_key(identity) {
            return Err(anyhow!("UNIQUE constraint failed: grades"));
        }
        let record = apply_in_memory(decision, now_timestamp());
        self.records.insert(record.identity.clone(), record.clone());
        self.writes += 1;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn candidate(student: &str, score: f64, comment: Option<&str>) -> RowCandidate {
        RowCandidate {
            row: 7,
            student_id: student.into(),
            subject_id: "subj-math".into(),
            course_id: "course-7".into(),
            semester_id: "sem-1".into(),
            school_year_id: "sy-2026".into(),
            month: 3,
            year: 2026,
            period_key: PeriodKey::new(3, 2026),
            score,
            comment: comment.map(str::to_string),
        }
    }

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4()));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn missing_identity_decides_create() {
        let store = MemoryGradeStore::default();
        let d = reconcile(&store, &candidate("s1", 9.0, None), Some("staff-1")).expect("reconcile");
        let Decision::Create(g) = d else {
            panic!("expected create");
        };
        assert_eq!(g.value, 9.0);
        assert_eq!(g.recorded_by.as_deref(), Some("staff-1"));
        assert_eq!(g.identity.period_key.as_str(), "03/26");
    }

    #[test]
    fn existing_identity_decides_update_keeping_identity() {
        let mut store = MemoryGradeStore::default();
        let first = reconcile(&store, &candidate("s1", 9.0, Some("ok")), None).expect("reconcile");
        let created = store.upsert(&first).expect("create");

        let second =
            reconcile(&store, &candidate("s1", 6.5, None), Some("staff-2")).expect("reconcile");
        assert_eq!(second.kind(), "update");
        let updated = store.upsert(&second).expect("update");
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.identity, created.identity);
        assert_eq!(updated.value, 6.5);
        assert_eq!(updated.comment, None);
        assert_eq!(updated.recorded_by.as_deref(), Some("staff-2"));
        assert_eq!(updated.created_at, created.created_at);
    }

    #[test]
    fn sqlite_store_creates_then_updates_one_row() {
        let ws = temp_workspace("gradebookd-reconcile");
        let conn = db::open_db(&ws).expect("open db");
        db::subject_upsert(&conn, "subj-math", "Mathematics").expect("subject");
        let mut store = SqliteGradeStore::new(&conn);

        let d1 = reconcile(&store, &candidate("s1", 7.0, Some("first")), None).expect("reconcile");
        let created = store.upsert(&d1).expect("insert");
        let d2 = reconcile(&store, &candidate("s1", 8.0, Some("second")), Some("t")).expect("reconcile");
        assert_eq!(d2.kind(), "update");
        let updated = store.upsert(&d2).expect("update");

        assert_eq!(created.id, updated.id);
        assert_eq!(updated.value, 8.0);
        assert_eq!(updated.comment.as_deref(), Some("second"));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM grades", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn sqlite_store_rejects_duplicate_identity_insert() {
        let ws = temp_workspace("gradebookd-unique");
        let conn = db::open_db(&ws).expect("open db");
        db::subject_upsert(&conn, "subj-math", "Mathematics").expect("subject");
        let mut store = SqliteGradeStore::new(&conn);

        let d = reconcile(&store, &candidate("s1", 7.0, None), None).expect("reconcile");
        store.upsert(&d).expect("insert");
        // A stale decision from a concurrent job trying to create the same identity.
        let err = store.upsert(&d).expect_err("unique violation");
        assert!(err.to_string().contains("UNIQUE"));
    }

    #[test]
    fn preview_store_sees_its_own_writes_without_persisting() {
        let ws = temp_workspace("gradebookd-preview");
        let conn = db::open_db(&ws).expect("open db");
        db::subject_upsert(&conn, "subj-math", "Mathematics").expect("subject");
        let base = SqliteGradeStore::new(&conn);
        let mut preview = PreviewStore::new(&base);

        let d1 = reconcile(&preview, &candidate("s1", 7.0, None), None).expect("reconcile");
        assert_eq!(d1.kind(), "create");
        preview.upsert(&d1).expect("stage");
        let d2 = reconcile(&preview, &candidate("s1", 9.0, None), None).expect("reconcile");
        assert_eq!(d2.kind(), "update");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM grades", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }
}
