use anyhow::Context;
use calamine::{open_workbook_auto, Data, Reader};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Scalar carried inside a formula-result container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Number(n) => f.write_str(&format_number(*n)),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// A cell that holds a previously computed result rather than a literal.
///
/// Depending on the producer the cached value shows up under `result`,
/// `value` or `text`; any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormulaResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

impl FormulaResult {
    /// First cached field present, in `result`, `value`, `text` order.
    pub fn extracted(&self) -> Option<String> {
        if let Some(v) = &self.result {
            return Some(v.to_string());
        }
        if let Some(v) = &self.value {
            return Some(v.to_string());
        }
        self.text.clone()
    }
}

impl fmt::Display for FormulaResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(v) = self.extracted() {
            return f.write_str(&v);
        }
        match &self.formula {
            Some(src) if src.starts_with('=') => f.write_str(src),
            Some(src) => write!(f, "={}", src),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
    Formula(FormulaResult),
}

static EMPTY_CELL: CellValue = CellValue::Empty;

impl CellValue {
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Number(n) => f.write_str(&format_number(*n)),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Formula(fr) => write!(f, "{}", fr),
        }
    }
}

/// Whole numbers render without a fractional part (`12.0` -> `"12"`).
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// One tab of a workbook. Cells are addressed by 1-based (row, column).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "SheetRows")]
pub struct Worksheet {
    pub title: String,
    cells: BTreeMap<(u32, u32), CellValue>,
}

impl Worksheet {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            cells: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, row: u32, col: u32, value: CellValue) {
        if value == CellValue::Empty {
            self.cells.remove(&(row, col));
        } else {
            self.cells.insert((row, col), value);
        }
    }

    pub fn cell(&self, row: u32, col: u32) -> &CellValue {
        self.cells.get(&(row, col)).unwrap_or(&EMPTY_CELL)
    }

    /// Last row holding any non-empty cell, 0 for an empty sheet.
    pub fn last_row(&self) -> u32 {
        self.cells.keys().next_back().map(|(r, _)| *r).unwrap_or(0)
    }
}

/// Row-major JSON shape: `rows[0]` is sheet row 1, `rows[0][0]` is column A.
#[derive(Debug, Deserialize)]
struct SheetRows {
    title: String,
    #[serde(default)]
    rows: Vec<Vec<CellValue>>,
}

impl From<SheetRows> for Worksheet {
    fn from(raw: SheetRows) -> Self {
        let mut sheet = Worksheet::new(raw.title);
        for (r, row) in raw.rows.into_iter().enumerate() {
            for (c, value) in row.into_iter().enumerate() {
                sheet.set(r as u32 + 1, c as u32 + 1, value);
            }
        }
        sheet
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Worksheet>,
}

/// Reads every worksheet of a spreadsheet file (xlsx, xlsm, xls, ods).
///
/// Cells that carry a formula become `CellValue::Formula` with the cached
/// result, so the importer never has to evaluate anything.
pub fn read_workbook_file(path: &Path) -> anyhow::Result<Workbook> {
    let mut book = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.to_string_lossy()))?;

    let mut sheets = Vec::new();
    for name in book.sheet_names() {
        let range = book
            .worksheet_range(&name)
            .with_context(|| format!("failed to read sheet {}", name))?;
        let mut sheet = Worksheet::new(name.clone());
        let (start_row, start_col) = range.start().unwrap_or((0, 0));
        for (r, c, data) in range.used_cells() {
            let row = start_row + r as u32 + 1;
            let col = start_col + c as u32 + 1;
            sheet.set(row, col, literal_from_data(data));
        }

        // Not every format exposes formulas; a sheet without them is still usable.
        if let Ok(formulas) = book.worksheet_formula(&name) {
            let (f_row, f_col) = formulas.start().unwrap_or((0, 0));
            for (r, c, src) in formulas.used_cells() {
                if src.trim().is_empty() {
                    continue;
                }
                let row = f_row + r as u32 + 1;
                let col = f_col + c as u32 + 1;
                let cached = sheet.cell(row, col).clone();
                sheet.set(row, col, formula_from_cached(src, cached));
            }
        }
        sheets.push(sheet);
    }

    Ok(Workbook { sheets })
}

fn literal_from_data(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::Text(format!("#{:?}", e)),
    }
}

fn formula_from_cached(src: &str, cached: CellValue) -> CellValue {
    let mut fr = FormulaResult {
        formula: Some(src.to_string()),
        ..FormulaResult::default()
    };
    match cached {
        CellValue::Number(n) => fr.result = Some(Scalar::Number(n)),
        CellValue::Bool(b) => fr.result = Some(Scalar::Bool(b)),
        // Error results (#DIV/0!, #REF!) are not a cached value.
        CellValue::Text(s) if s.starts_with('#') => {}
        CellValue::Text(s) => fr.text = Some(s),
        CellValue::Empty | CellValue::Formula(_) => {}
    }
    CellValue::Formula(fr)
}
