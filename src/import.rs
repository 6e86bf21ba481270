use crate::config::SheetLayout;
use crate::error::{ImportError, ImportIssue};
use crate::extract::{extract_rows, RowCandidate, RowRead};
use crate::reconcile::{reconcile, Decision, GradeStore};
use crate::subjects::SubjectDirectory;
use crate::workbook::{Workbook, Worksheet};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const DEFAULT_ERROR_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions<'a> {
    pub layout: SheetLayout,
    pub error_limit: usize,
    pub recorded_by: Option<&'a str>,
}

impl Default for ImportOptions<'_> {
    fn default() -> Self {
        Self {
            layout: SheetLayout::default(),
            error_limit: DEFAULT_ERROR_LIMIT,
            recorded_by: None,
        }
    }
}

/// What happened to one data row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Created,
    Updated,
    /// Rejected before any write.
    Skipped(ImportError),
    /// The write itself failed.
    Failed(ImportError),
}

/// Job summary handed back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unmatched_sheets: usize,
    pub blank_rows: usize,
    /// Every recorded error, including those cut from `errors`.
    pub error_count: usize,
    pub errors: Vec<String>,
    pub errors_truncated: bool,
    pub matched_subjects: Vec<String>,
}

/// Running counters owned by the single import worker.
#[derive(Debug)]
struct ImportTally {
    result: ImportResult,
    error_limit: usize,
}

impl ImportTally {
    fn new(error_limit: usize) -> Self {
        Self {
            result: ImportResult::default(),
            error_limit: error_limit.max(1),
        }
    }

    fn record_issue(&mut self, issue: ImportIssue) {
        self.result.error_count += 1;
        if self.result.errors.len() < self.error_limit {
            self.result.errors.push(issue.to_string());
        } else {
            self.result.errors_truncated = true;
        }
    }

    fn record_outcome(&mut self, sheet: &str, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Created => self.result.created += 1,
            RowOutcome::Updated => self.result.updated += 1,
            RowOutcome::Skipped(error) => {
                self.result.skipped += 1;
                self.record_issue(ImportIssue {
                    sheet: sheet.to_string(),
                    error,
                });
            }
            RowOutcome::Failed(error) => {
                self.result.failed += 1;
                self.record_issue(ImportIssue {
                    sheet: sheet.to_string(),
                    error,
                });
            }
        }
    }

    fn finish(self) -> ImportResult {
        self.result
    }
}

/// Every worksheet after the instruction sheet, or a structural error when
/// there is no subject sheet at all.
pub fn subject_sheets(workbook: &Workbook) -> Result<&[Worksheet], ImportError> {
    if workbook.sheets.len() < 2 {
        return Err(ImportError::Structural {
            found: workbook.sheets.len(),
        });
    }
    Ok(&workbook.sheets[1..])
}

/// Runs the whole pipeline over one workbook.
///
/// Sheets and rows are handled strictly in order, each row's lookup
/// happening after the previous row's write. Only a structural problem
/// returns `Err`; everything else is folded into the result.
pub fn run_import<S: GradeStore + ?Sized>(
    workbook: &Workbook,
    directory: &SubjectDirectory,
    store: &mut S,
    options: &ImportOptions<'_>,
) -> Result<ImportResult, ImportError> {
    let sheets = subject_sheets(workbook)?;
    info!(
        sheets = sheets.len(),
        subjects = directory.len(),
        "grade import started"
    );
    if directory.is_empty() {
        warn!("subject catalog is empty; every worksheet will be unmatched");
    }

    let mut tally = ImportTally::new(options.error_limit);
    for sheet in sheets {
        let subject = match directory.resolve(&sheet.title) {
            Ok(s) => s,
            Err(error) => {
                warn!(sheet = %sheet.title, "worksheet skipped: no matching subject");
                tally.result.unmatched_sheets += 1;
                tally.record_issue(ImportIssue {
                    sheet: sheet.title.clone(),
                    error,
                });
                continue;
            }
        };
        debug!(sheet = %sheet.title, subject = subject.name, tier = ?subject.tier, "worksheet matched");
        tally.result.matched_subjects.push(sheet.title.clone());

        for read in extract_rows(sheet, subject.id, &options.layout) {
            let outcome = match read {
                RowRead::Blank => {
                    tally.result.blank_rows += 1;
                    continue;
                }
                RowRead::Invalid(error) => RowOutcome::Skipped(error),
                RowRead::Candidate(candidate) => {
                    apply_candidate(store, &candidate, options.recorded_by)
                }
            };
            if let RowOutcome::Skipped(e) | RowOutcome::Failed(e) = &outcome {
                warn!(sheet = %sheet.title, row = ?e.row(), code = e.code(), "{}", e);
            }
            tally.record_outcome(&sheet.title, outcome);
        }
    }

    let result = tally.finish();
    info!(
        created = result.created,
        updated = result.updated,
        skipped = result.skipped,
        failed = result.failed,
        unmatched_sheets = result.unmatched_sheets,
        "grade import finished"
    );
    Ok(result)
}

/// Reconciles one candidate and writes the decision. Any store failure is
/// confined to this row.
fn apply_candidate<S: GradeStore + ?Sized>(
    store: &mut S,
    candidate: &RowCandidate,
    recorded_by: Option<&str>,
) -> RowOutcome {
    let persistence = |e: anyhow::Error| ImportError::Persistence {
        row: candidate.row,
        message: format!("{:#}", e),
    };

    let decision = match reconcile(store, candidate, recorded_by) {
        Ok(d) => d,
        Err(e) => return RowOutcome::Failed(persistence(e)),
    };
    debug!(
        row = candidate.row,
        student = %candidate.student_id,
        period = %candidate.period_key,
        decision = decision.kind(),
        "row reconciled"
    );
    match store.upsert(&decision) {
        Ok(_) => match decision {
            Decision::Create(_) => RowOutcome::Created,
            Decision::Update { .. } => RowOutcome::Updated,
        },
        Err(e) => RowOutcome::Failed(persistence(e)),
    }
}
