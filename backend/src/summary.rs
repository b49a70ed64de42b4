//! Aggregation of per-row outcomes into the job report.

use serde::{Deserialize, Serialize};

use crate::models::{ImportResult, ImportStatus};

/// A failed row kept for the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSample {
    pub line: usize,
    pub message: String,
}

/// Everything known about a job: counters, a bounded error sample and the
/// per-row results in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<ErrorSample>,
    pub results: Vec<ImportResult>,
}

impl ImportSummary {
    /// The external report shape, without per-row results.
    pub fn report(&self) -> ImportReport {
        ImportReport {
            total: self.total,
            created: self.created,
            updated: self.updated,
            skipped: self.skipped,
            failed: self.failed,
            errors: self.errors.clone(),
        }
    }
}

/// `{ total, created, updated, skipped, failed, errors: [{ line, message }] }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<ErrorSample>,
}

/// Running totals for a job.
#[derive(Debug, Clone)]
pub struct SummaryAccumulator {
    max_samples: usize,
    summary: ImportSummary,
}

impl SummaryAccumulator {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples,
            summary: ImportSummary::default(),
        }
    }

    pub fn record(&mut self, result: ImportResult) {
        let summary = &mut self.summary;
        summary.total += 1;
        match result.status {
            ImportStatus::Created => summary.created += 1,
            ImportStatus::Updated => summary.updated += 1,
            ImportStatus::Skipped => summary.skipped += 1,
            ImportStatus::Failed => {
                summary.failed += 1;
                if summary.errors.len() < self.max_samples {
                    summary.errors.push(ErrorSample {
                        line: result.line,
                        message: result.error.clone().unwrap_or_default(),
                    });
                }
            }
        }
        summary.results.push(result);
    }

    pub fn record_all(&mut self, results: impl IntoIterator<Item = ImportResult>) {
        for result in results {
            self.record(result);
        }
    }

    pub fn total(&self) -> usize {
        self.summary.total
    }

    pub fn snapshot(&self) -> ImportSummary {
        self.summary.clone()
    }

    pub fn finish(self) -> ImportSummary {
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(line: usize, status: ImportStatus) -> ImportResult {
        ImportResult {
            line,
            status,
            member_id: None,
            user_id: None,
            error: None,
        }
    }

    #[test]
    fn test_counts_add_up_to_total() {
        let mut acc = SummaryAccumulator::new(10);
        acc.record_all([
            ok(2, ImportStatus::Created),
            ok(3, ImportStatus::Updated),
            ok(4, ImportStatus::Skipped),
            ImportResult::failed(5, "work_email: Email is empty"),
        ]);

        let summary = acc.snapshot();
        assert_eq!(summary.total, 4);
        assert_eq!(
            summary.created + summary.updated + summary.skipped + summary.failed,
            summary.total
        );
        assert_eq!(
            summary.errors,
            vec![ErrorSample {
                line: 5,
                message: "work_email: Email is empty".into()
            }]
        );
        let lines: Vec<usize> = summary.results.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_error_sample_is_bounded() {
        let mut acc = SummaryAccumulator::new(2);
        acc.record_all((2..12).map(|line| ImportResult::failed(line, "bad")));

        let summary = acc.finish();
        assert_eq!(summary.failed, 10);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.errors[1].line, 3);
    }

    #[test]
    fn test_report_shape() {
        let mut acc = SummaryAccumulator::new(5);
        acc.record(ImportResult::failed(7, "Role 'x' does not exist"));

        let json = serde_json::to_value(acc.snapshot().report()).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["errors"][0]["line"], 7);
        assert!(json.get("results").is_none());
    }
}
