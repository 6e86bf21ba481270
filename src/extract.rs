use crate::config::SheetLayout;
use crate::error::ImportError;
use crate::normalize::{normalize_score, PeriodKey};
use crate::workbook::{format_number, CellValue, Worksheet};

/// One worksheet row, ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct RowCandidate {
    pub row: u32,
    pub student_id: String,
    pub subject_id: String,
    pub course_id: String,
    pub semester_id: String,
    pub school_year_id: String,
    pub month: u32,
    pub year: i32,
    pub period_key: PeriodKey,
    pub score: f64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowRead {
    /// No student name: a separator row, not an error.
    Blank,
    Invalid(ImportError),
    Candidate(RowCandidate),
}

/// Walks the data rows of a subject sheet in order.
pub fn extract_rows<'a>(
    sheet: &'a Worksheet,
    subject_id: &'a str,
    layout: &'a SheetLayout,
) -> impl Iterator<Item = RowRead> + 'a {
    (layout.data_start_row..=sheet.last_row())
        .map(move |row| extract_row(sheet, row, subject_id, layout))
}

pub fn extract_row(sheet: &Worksheet, row: u32, subject_id: &str, layout: &SheetLayout) -> RowRead {
    if cell_text(sheet.cell(row, layout.student_name)).is_none() {
        return RowRead::Blank;
    }

    let student_id = cell_text(sheet.cell(row, layout.student_id));
    let course_id = cell_text(sheet.cell(row, layout.course_id));
    let semester_id = cell_text(sheet.cell(row, layout.semester_id));
    let school_year_id = cell_text(sheet.cell(row, layout.school_year_id));
    let month_raw = cell_text(sheet.cell(row, layout.month));
    let year_raw = cell_text(sheet.cell(row, layout.year));

    let subject_id = Some(subject_id.trim().to_string()).filter(|s| !s.is_empty());

    let mut missing = Vec::new();
    for (name, v) in [
        ("studentId", &student_id),
        ("subjectId", &subject_id),
        ("courseId", &course_id),
        ("semesterId", &semester_id),
        ("schoolYearId", &school_year_id),
        ("month", &month_raw),
        ("year", &year_raw),
    ] {
        if v.is_none() {
            missing.push(name);
        }
    }
    let (
        Some(student_id),
        Some(subject_id),
        Some(course_id),
        Some(semester_id),
        Some(school_year_id),
        Some(month_raw),
        Some(year_raw),
    ) = (
        student_id,
        subject_id,
        course_id,
        semester_id,
        school_year_id,
        month_raw,
        year_raw,
    )
    else {
        return RowRead::Invalid(ImportError::RowValidation {
            row,
            message: format!("missing {}", missing.join(", ")),
        });
    };

    let Some(month) = parse_month(&month_raw) else {
        return RowRead::Invalid(ImportError::RowValidation {
            row,
            message: format!("invalid month {:?}", month_raw),
        });
    };
    let Some(year) = parse_year(&year_raw) else {
        return RowRead::Invalid(ImportError::RowValidation {
            row,
            message: format!("invalid year {:?}", year_raw),
        });
    };

    let score = match normalize_score(sheet.cell(row, layout.total)) {
        Ok(v) => v,
        Err(e) => return RowRead::Invalid(ImportError::ValueParse { row, raw: e.raw }),
    };
    let comment = cell_text(sheet.cell(row, layout.notes));

    RowRead::Candidate(RowCandidate {
        row,
        student_id,
        subject_id,
        course_id,
        semester_id,
        school_year_id,
        month,
        year,
        period_key: PeriodKey::new(month, year),
        score,
        comment,
    })
}

/// Trimmed text of a metadata or display cell, `None` when blank.
fn cell_text(cell: &CellValue) -> Option<String> {
    let s = match cell {
        CellValue::Empty => return None,
        CellValue::Number(n) => format_number(*n),
        CellValue::Formula(fr) => fr.extracted()?,
        other => other.to_string(),
    };
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn parse_whole(raw: &str) -> Option<i64> {
    let v = raw.trim().parse::<f64>().ok()?;
    if !v.is_finite() || v.fract() != 0.0 {
        return None;
    }
    Some(v as i64)
}

fn parse_month(raw: &str) -> Option<u32> {
    parse_whole(raw)
        .filter(|m| (1..=12).contains(m))
        .map(|m| m as u32)
}

fn parse_year(raw: &str) -> Option<i32> {
    parse_whole(raw)
        .filter(|y| (1000..=9999).contains(y))
        .map(|y| y as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::{FormulaResult, Scalar};

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn num(n: f64) -> CellValue {
        CellValue::Number(n)
    }

    fn sheet_with_row(row: u32, cells: &[(u32, CellValue)]) -> Worksheet {
        let mut sheet = Worksheet::new("Mathematics");
        for (col, v) in cells {
            sheet.set(row, *col, v.clone());
        }
        sheet
    }

    fn full_row() -> Vec<(u32, CellValue)> {
        vec![
            (1, num(1.0)),
            (2, text("Nguyen An")),
            (6, num(8.5)),
            (7, text("  good progress ")),
            (8, num(1042.0)),
            (9, text("course-7")),
            (10, text("sem-1")),
            (11, text("sy-2026")),
            (12, text("3")),
            (13, num(2026.0)),
        ]
    }

    #[test]
    fn complete_row_becomes_candidate() {
        let layout = SheetLayout::default();
        let sheet = sheet_with_row(7, &full_row());
        let RowRead::Candidate(c) = extract_row(&sheet, 7, "subj-math", &layout) else {
            panic!("expected candidate");
        };
        assert_eq!(c.row, 7);
        assert_eq!(c.student_id, "1042");
        assert_eq!(c.subject_id, "subj-math");
        assert_eq!(c.course_id, "course-7");
        assert_eq!(c.period_key.as_str(), "03/26");
        assert_eq!(c.score, 8.5);
        assert_eq!(c.comment.as_deref(), Some("good progress"));
    }

    #[test]
    fn row_without_name_is_blank() {
        let layout = SheetLayout::default();
        let mut cells = full_row();
        cells.retain(|(col, _)| *col != 2);
        let sheet = sheet_with_row(8, &cells);
        assert_eq!(extract_row(&sheet, 8, "subj-math", &layout), RowRead::Blank);
    }

    #[test]
    fn missing_metadata_is_row_validation_error() {
        let layout = SheetLayout::default();
        let mut cells = full_row();
        cells.retain(|(col, _)| *col != 8 && *col != 10);
        let sheet = sheet_with_row(9, &cells);
        assert_eq!(
            extract_row(&sheet, 9, "subj-math", &layout),
            RowRead::Invalid(ImportError::RowValidation {
                row: 9,
                message: "missing studentId, semesterId".into()
            })
        );
    }

    #[test]
    fn out_of_range_month_is_rejected() {
        let layout = SheetLayout::default();
        let mut cells = full_row();
        cells.retain(|(col, _)| *col != 12);
        cells.push((12, num(13.0)));
        let sheet = sheet_with_row(7, &cells);
        let RowRead::Invalid(ImportError::RowValidation { message, .. }) =
            extract_row(&sheet, 7, "subj-math", &layout)
        else {
            panic!("expected validation error");
        };
        assert!(message.contains("invalid month"));
    }

    #[test]
    fn two_digit_year_is_rejected() {
        let layout = SheetLayout::default();
        let mut cells = full_row();
        cells.retain(|(col, _)| *col != 13);
        cells.push((13, text("26")));
        let sheet = sheet_with_row(7, &cells);
        assert!(matches!(
            extract_row(&sheet, 7, "subj-math", &layout),
            RowRead::Invalid(ImportError::RowValidation { .. })
        ));
    }

    #[test]
    fn literal_junk_score_is_value_parse_error() {
        let layout = SheetLayout::default();
        let mut cells = full_row();
        cells.retain(|(col, _)| *col != 6);
        cells.push((6, text("N/A")));
        let sheet = sheet_with_row(7, &cells);
        assert_eq!(
            extract_row(&sheet, 7, "subj-math", &layout),
            RowRead::Invalid(ImportError::ValueParse {
                row: 7,
                raw: "N/A".into()
            })
        );
    }

    #[test]
    fn formula_metadata_uses_cached_value() {
        let layout = SheetLayout::default();
        let mut cells = full_row();
        cells.retain(|(col, _)| *col != 8);
        cells.push((
            8,
            CellValue::Formula(FormulaResult {
                result: Some(Scalar::Number(77.0)),
                formula: Some("Roster!A2".into()),
                ..FormulaResult::default()
            }),
        ));
        let sheet = sheet_with_row(7, &cells);
        let RowRead::Candidate(c) = extract_row(&sheet, 7, "subj-math", &layout) else {
            panic!("expected candidate");
        };
        assert_eq!(c.student_id, "77");
    }

    #[test]
    fn rows_above_data_offset_are_never_read() {
        let layout = SheetLayout::default();
        let mut sheet = sheet_with_row(7, &full_row());
        // Header row with a "name" in the name column.
        sheet.set(6, 2, text("Student name"));
        let reads: Vec<_> = extract_rows(&sheet, "subj-math", &layout).collect();
        assert_eq!(reads.len(), 1);
        assert!(matches!(reads[0], RowRead::Candidate(_)));
    }
}
