use std::fmt;

use thiserror::Error;

/// Failures raised while importing a grade workbook.
///
/// Only `Structural` aborts a job. Every other variant is scoped to one
/// worksheet or one row and ends up in the job's error list.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ImportError {
    #[error(
        "workbook has {found} worksheet(s); expected an instruction sheet followed by at least one subject sheet"
    )]
    Structural { found: usize },

    #[error("no subject matches worksheet title \"{title}\"")]
    SubjectResolution { title: String },

    #[error("row {row}: {message}")]
    RowValidation { row: u32, message: String },

    #[error("row {row}: score \"{raw}\" is not a number")]
    ValueParse { row: u32, raw: String },

    #[error("row {row}: failed to save grade: {message}")]
    Persistence { row: u32, message: String },
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Structural { .. } => "structural",
            Self::SubjectResolution { .. } => "subject_not_found",
            Self::RowValidation { .. } => "row_invalid",
            Self::ValueParse { .. } => "value_parse",
            Self::Persistence { .. } => "persistence",
        }
    }

    pub fn row(&self) -> Option<u32> {
        match self {
            Self::RowValidation { row, .. }
            | Self::ValueParse { row, .. }
            | Self::Persistence { row, .. } => Some(*row),
            Self::Structural { .. } | Self::SubjectResolution { .. } => None,
        }
    }
}

/// An error tied to the worksheet it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportIssue {
    pub sheet: String,
    pub error: ImportError,
}

impl fmt::Display for ImportIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            // The message already names the sheet.
            ImportError::SubjectResolution { .. } => write!(f, "{}", self.error),
            other => write!(f, "[{}] {}", self.sheet, other),
        }
    }
}
