//! Top-level import job: parse, chunk, process, summarize.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::cleaner::{DataCleaner, DomainBlacklist, DomainValidator, WORK_EMAIL};
use crate::config::{ImportConfig, JobLimits};
use crate::error::{ImportError, JobFailure, JobResult};
use crate::events::{ImportEvent, ProgressBroadcaster};
use crate::models::RawRow;
use crate::parser::CsvParser;
use crate::pipeline::ChunkProcessor;
use crate::services::{MemberService, RoleAssignmentService, UserImportService};
use crate::store::{MemberRepository, RoleRepository, UserRepository};
use crate::summary::{ImportSummary, SummaryAccumulator};

/// Stand-in deadline for budgets too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Per-run knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub chunk_size: usize,
    /// Overrides the deadline derived from [`JobLimits`].
    pub deadline: Option<Duration>,
    /// Checked between chunks.
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Runs an import job over one uploaded file.
///
/// Chunks are processed one after another in file order. A fatal error
/// (parse, missing column, connectivity, deadline, cancellation) stops the
/// job and returns the summary of every chunk completed before it.
#[derive(Clone)]
pub struct ImportOrchestrator {
    parser: CsvParser,
    processor: ChunkProcessor,
    max_error_samples: usize,
    limits: JobLimits,
    progress: ProgressBroadcaster,
}

impl ImportOrchestrator {
    pub fn new(
        config: &ImportConfig,
        members: Arc<dyn MemberRepository>,
        users: Arc<dyn UserRepository>,
        roles: Arc<dyn RoleRepository>,
        domains: Arc<dyn DomainValidator>,
    ) -> JobResult<Self> {
        config.validate()?;

        let retry = config.retry;
        let processor = ChunkProcessor::new(
            DataCleaner::new(domains.clone(), config.default_affiliate_id),
            MemberService::new(members.clone(), domains, retry),
            UserImportService::new(users, members, retry),
            RoleAssignmentService::new(roles, config.role_map.clone(), retry),
        );
        let parser = match config.delimiter {
            Some(delimiter) => CsvParser::with_delimiter(delimiter),
            None => CsvParser::new(),
        };

        Ok(Self {
            parser,
            processor,
            max_error_samples: config.max_error_samples,
            limits: config.limits,
            progress: ProgressBroadcaster::new(),
        })
    }

    /// Build against one store that implements every repository, using the
    /// configured domain blacklist.
    pub fn from_store<S>(config: &ImportConfig, store: Arc<S>) -> JobResult<Self>
    where
        S: MemberRepository + UserRepository + RoleRepository + 'static,
    {
        let domains = Arc::new(DomainBlacklist::new(&config.blacklisted_domains));
        Self::new(config, store.clone(), store.clone(), store, domains)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.progress.subscribe()
    }

    pub async fn run<R: Read>(
        &self,
        reader: R,
        chunk_size: usize,
    ) -> Result<ImportSummary, JobFailure> {
        self.run_with(reader, RunOptions::new(chunk_size)).await
    }

    /// Run one job with explicit options.
    ///
    /// `reader` is read synchronously on the calling task. The deadline is
    /// checked before every row is read and bounds chunk processing, but a
    /// single `read` that blocks is not interrupted.
    pub async fn run_with<R: Read>(
        &self,
        reader: R,
        options: RunOptions,
    ) -> Result<ImportSummary, JobFailure> {
        let mut summary = SummaryAccumulator::new(self.max_error_samples);
        let budget = options.deadline.unwrap_or_else(|| self.limits.deadline());
        let now = Instant::now();
        let deadline = now.checked_add(budget).unwrap_or(now + FAR_FUTURE);

        if options.chunk_size == 0 {
            let err = ImportError::InvalidConfig("chunk_size must be at least 1".to_string());
            return Err(self.abort(err, summary));
        }

        let mut rows = match self.parser.open(reader) {
            Ok(rows) => rows,
            Err(err) => return Err(self.abort(err.into(), summary)),
        };
        if !rows.has_column(WORK_EMAIL) {
            let err = ImportError::MissingColumn(WORK_EMAIL.to_string());
            return Err(self.abort(err, summary));
        }

        tracing::info!(
            chunk_size = options.chunk_size,
            delimiter = ?rows.delimiter(),
            columns = rows.headers().len(),
            budget_secs = budget.as_secs(),
            "import started"
        );
        self.progress.publish(ImportEvent::Started {
            chunk_size: options.chunk_size,
        });

        let mut chunk_no = 0;
        let mut exhausted = false;
        while !exhausted {
            if options.cancel.is_cancelled() {
                return Err(self.abort(ImportError::Cancelled, summary));
            }

            let mut chunk: Vec<RawRow> = Vec::with_capacity(options.chunk_size);
            let mut parse_error = None;
            while chunk.len() < options.chunk_size {
                if Instant::now() >= deadline {
                    return Err(self.abort(ImportError::Timeout(budget), summary));
                }
                match rows.next() {
                    Some(Ok(row)) => chunk.push(row),
                    Some(Err(err)) => {
                        parse_error = Some(err);
                        break;
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }

            if !chunk.is_empty() {
                chunk_no += 1;
                let size = chunk.len();
                match timeout_at(deadline, self.processor.process_chunk(chunk)).await {
                    Ok(Ok(results)) => summary.record_all(results),
                    Ok(Err(err)) => return Err(self.abort(err, summary)),
                    Err(_) => return Err(self.abort(ImportError::Timeout(budget), summary)),
                }
                tracing::debug!(
                    chunk = chunk_no,
                    rows = size,
                    processed = summary.total(),
                    "chunk completed"
                );
                self.progress.publish(ImportEvent::ChunkCompleted {
                    chunk: chunk_no,
                    rows: size,
                    processed: summary.total(),
                });
            }

            if let Some(err) = parse_error {
                return Err(self.abort(err.into(), summary));
            }
        }

        let summary = summary.finish();
        tracing::info!(
            total = summary.total,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "import finished"
        );
        self.progress.publish(ImportEvent::Finished {
            total: summary.total,
            created: summary.created,
            updated: summary.updated,
            skipped: summary.skipped,
            failed: summary.failed,
        });
        Ok(summary)
    }

    fn abort(&self, error: ImportError, summary: SummaryAccumulator) -> JobFailure {
        let partial = summary.finish();
        tracing::warn!(error = %error, processed = partial.total, "import aborted");
        self.progress.publish(ImportEvent::Aborted {
            reason: error.to_string(),
            processed: partial.total,
        });
        JobFailure { error, partial }
    }
}
