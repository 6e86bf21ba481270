use crate::workbook::CellValue;
use serde::Serialize;
use std::fmt;

/// A score cell that could not be read as a number.
#[derive(Debug, Clone, PartialEq)]
pub struct UnparsableScore {
    pub raw: String,
}

/// Converts a raw score cell into a numeric score.
///
/// Blank cells and explicit zeros are `0.0`. Formula containers that hold
/// nothing numeric are treated as "no score yet" and also yield `0.0`; only
/// literal cells can fail. No range is enforced here.
pub fn normalize_score(cell: &CellValue) -> Result<f64, UnparsableScore> {
    if cell.is_blank() {
        return Ok(0.0);
    }
    let raw = cell.to_string();
    match parse_number(&raw) {
        Some(v) => Ok(v),
        None if matches!(cell, CellValue::Formula(_)) => {
            tracing::debug!(raw = %raw, "formula cell has no numeric result, using 0");
            Ok(0.0)
        }
        None => Err(UnparsableScore { raw }),
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let t = raw.trim();
    if t.is_empty() {
        return Some(0.0);
    }
    t.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Canonical `MM/YY` period string used inside a grade identity.
///
/// Years that share their last two digits collide (2025 and 2125 both give
/// `/25`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeriodKey(String);

impl PeriodKey {
    pub fn new(month: u32, year: i32) -> Self {
        Self(format!("{:02}/{:02}", month, year.rem_euclid(100)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps a key that was already stored in canonical form.
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::{FormulaResult, Scalar};

    fn formula(result: Option<Scalar>, value: Option<Scalar>, text: Option<&str>) -> CellValue {
        CellValue::Formula(FormulaResult {
            result,
            value,
            text: text.map(str::to_string),
            formula: Some("SUM(C8:E8)".into()),
        })
    }

    #[test]
    fn formula_result_field_is_extracted() {
        let cell = formula(Some(Scalar::Number(92.0)), None, None);
        assert_eq!(normalize_score(&cell), Ok(92.0));
    }

    #[test]
    fn formula_text_field_is_last_resort() {
        let cell = formula(None, None, Some("78"));
        assert_eq!(normalize_score(&cell), Ok(78.0));

        let value_wins = formula(None, Some(Scalar::Text("64.5".into())), Some("12"));
        assert_eq!(normalize_score(&value_wins), Ok(64.5));
    }

    #[test]
    fn empty_and_zero_cells_are_zero_scores() {
        assert_eq!(normalize_score(&CellValue::Empty), Ok(0.0));
        assert_eq!(normalize_score(&CellValue::Text("0".into())), Ok(0.0));
        assert_eq!(normalize_score(&CellValue::Text("   ".into())), Ok(0.0));
        assert_eq!(normalize_score(&CellValue::Number(0.0)), Ok(0.0));
    }

    #[test]
    fn unparseable_formula_defaults_to_zero() {
        let cell = formula(None, None, None);
        assert_eq!(normalize_score(&cell), Ok(0.0));

        let junk = formula(Some(Scalar::Text("pending".into())), None, None);
        assert_eq!(normalize_score(&junk), Ok(0.0));
    }

    #[test]
    fn unparseable_literal_is_an_error() {
        assert_eq!(
            normalize_score(&CellValue::Text("N/A".into())),
            Err(UnparsableScore { raw: "N/A".into() })
        );
        assert!(normalize_score(&CellValue::Text("NaN".into())).is_err());
        assert!(normalize_score(&CellValue::Bool(true)).is_err());
    }

    #[test]
    fn literals_parse_without_bounds() {
        assert_eq!(normalize_score(&CellValue::Number(8.75)), Ok(8.75));
        assert_eq!(normalize_score(&CellValue::Text(" 115 ".into())), Ok(115.0));
        assert_eq!(normalize_score(&CellValue::Number(-2.0)), Ok(-2.0));
    }

    #[test]
    fn period_key_is_deterministic() {
        for _ in 0..5 {
            assert_eq!(PeriodKey::new(3, 2026).as_str(), "03/26");
        }
        assert_eq!(PeriodKey::new(11, 2005).as_str(), "11/05");
    }

    #[test]
    fn period_key_century_collision_is_kept() {
        assert_eq!(PeriodKey::new(1, 2025), PeriodKey::new(1, 2125));
    }
}
