use crate::db;
use anyhow::{anyhow, Context};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

pub const SETTINGS_KEY: &str = "setup.gradeImport";

/// Per-workspace import settings, stored as JSON under `SETTINGS_KEY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportConfig {
    /// 1-based row of the first data row; everything above is banner/header.
    pub data_start_row: u32,
    pub error_limit: usize,
    pub student_name_column: String,
    pub total_column: String,
    pub notes_column: String,
    pub student_id_column: String,
    pub course_id_column: String,
    pub semester_id_column: String,
    pub school_year_id_column: String,
    pub month_column: String,
    pub year_column: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            data_start_row: 7,
            error_limit: 10,
            student_name_column: "B".into(),
            total_column: "F".into(),
            notes_column: "G".into(),
            student_id_column: "H".into(),
            course_id_column: "I".into(),
            semester_id_column: "J".into(),
            school_year_id_column: "K".into(),
            month_column: "L".into(),
            year_column: "M".into(),
        }
    }
}

/// Resolved 1-based column positions of a subject sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetLayout {
    pub data_start_row: u32,
    pub student_name: u32,
    pub total: u32,
    pub notes: u32,
    pub student_id: u32,
    pub course_id: u32,
    pub semester_id: u32,
    pub school_year_id: u32,
    pub month: u32,
    pub year: u32,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            data_start_row: 7,
            student_name: 2,
            total: 6,
            notes: 7,
            student_id: 8,
            course_id: 9,
            semester_id: 10,
            school_year_id: 11,
            month: 12,
            year: 13,
        }
    }
}

impl ImportConfig {
    pub fn layout(&self) -> anyhow::Result<SheetLayout> {
        if self.data_start_row == 0 {
            return Err(anyhow!("dataStartRow must be >= 1"));
        }
        let col = |name: &str, letters: &str| {
            column_index(letters).ok_or_else(|| anyhow!("{} is not a column: {:?}", name, letters))
        };
        Ok(SheetLayout {
            data_start_row: self.data_start_row,
            student_name: col("studentNameColumn", &self.student_name_column)?,
            total: col("totalColumn", &self.total_column)?,
            notes: col("notesColumn", &self.notes_column)?,
            student_id: col("studentIdColumn", &self.student_id_column)?,
            course_id: col("courseIdColumn", &self.course_id_column)?,
            semester_id: col("semesterIdColumn", &self.semester_id_column)?,
            school_year_id: col("schoolYearIdColumn", &self.school_year_id_column)?,
            month: col("monthColumn", &self.month_column)?,
            year: col("yearColumn", &self.year_column)?,
        })
    }
}

/// Spreadsheet column letters to a 1-based index (`A` -> 1, `AA` -> 27).
/// Accepts up to `XFD`, the last column of an xlsx sheet.
pub fn column_index(letters: &str) -> Option<u32> {
    let t = letters.trim();
    if t.is_empty() || t.len() > 3 {
        return None;
    }
    let mut idx: u32 = 0;
    for ch in t.chars() {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        idx = idx * 26 + (ch.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    if idx > 16_384 {
        return None;
    }
    Some(idx)
}

/// Saved settings layered over the defaults. Malformed saved values fall back
/// to the defaults instead of blocking imports.
pub fn load(conn: &Connection) -> anyhow::Result<ImportConfig> {
    let saved = db::settings_get_json(conn, SETTINGS_KEY)
        .context("failed to read import settings")?;
    let Some(saved) = saved else {
        return Ok(ImportConfig::default());
    };
    match serde_json::from_value::<ImportConfig>(saved) {
        Ok(cfg) if cfg.layout().is_ok() => Ok(cfg),
        Ok(_) | Err(_) => {
            tracing::warn!(key = SETTINGS_KEY, "ignoring malformed import settings");
            Ok(ImportConfig::default())
        }
    }
}
