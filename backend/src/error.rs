//! Error types for the onboarding pipeline.
//!
//! Errors are split by how far they are allowed to travel:
//!
//! - [`ParseError`] - file-level failures while reading the upload (job-fatal)
//! - [`StoreError`] - repository failures, classified for the retry policy
//! - [`RowError`] - per-row failures, recorded as `failed` results
//! - [`ImportError`] - job-fatal errors that stop the orchestrator
//! - [`JobFailure`] - an [`ImportError`] together with the partial summary
//!
//! Conversions are implemented with `From` so `?` works across layers.

use thiserror::Error;

use crate::models::FieldError;
use crate::summary::ImportSummary;

// =============================================================================
// Parse Errors
// =============================================================================

/// Fatal errors while reading the uploaded file.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The underlying reader failed.
    #[error("Failed to read upload: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not UTF-8 encoded.
    #[error("Unsupported encoding at line {line}: {message}")]
    Encoding { line: usize, message: String },

    /// The file has no header line, or the header has no column names.
    #[error("CSV header is missing or empty")]
    EmptyHeader,

    /// A record could not be parsed.
    #[error("Malformed CSV at line {line}: {message}")]
    Malformed { line: usize, message: String },
}

impl ParseError {
    /// Source line the error refers to, when known.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::Encoding { line, .. } | Self::Malformed { line, .. } => Some(*line),
            Self::Io(_) | Self::EmptyHeader => None,
        }
    }
}

impl From<csv::Error> for ParseError {
    fn from(err: csv::Error) -> Self {
        let line = err
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or_default();
        match err.into_kind() {
            csv::ErrorKind::Io(e) => Self::Io(e),
            csv::ErrorKind::Utf8 { err, .. } => Self::Encoding {
                line,
                message: err.to_string(),
            },
            other => Self::Malformed {
                line,
                message: format!("{:?}", other),
            },
        }
    }
}

// =============================================================================
// Store Errors
// =============================================================================

/// Errors raised by repository implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// The row to update no longer exists.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A failure worth retrying (deadlock, serialization failure, timeout).
    #[error("Transient database error: {0}")]
    Transient(String),

    /// Connectivity to the database is gone.
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    /// A stored row holds a value this crate cannot read back.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// =============================================================================
// Row Errors
// =============================================================================

/// A failure scoped to one input row.
///
/// Row errors never reach the caller as errors: the chunk processor turns
/// them into `failed` import results. The one exception is
/// [`RowError::Store`] wrapping [`StoreError::Unavailable`], which the
/// processor promotes to [`ImportError::Connectivity`].
#[derive(Debug, Error)]
pub enum RowError {
    /// One or more fields failed validation.
    #[error("{}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    /// The email domain is blacklisted.
    #[error("Email domain '{0}' is not allowed")]
    BlacklistedDomain(String),

    /// A concurrent writer kept winning the member upsert race.
    #[error("Member write conflicted {attempts} times, giving up")]
    Conflict { attempts: u32 },

    /// The user account for this email is linked to another member.
    #[error("User '{email}' is already linked to another member")]
    DuplicateEmail { email: String },

    /// The role map names a role that does not exist.
    #[error("Role '{0}' does not exist")]
    UnknownRole(String),

    /// A store error that survived the retry policy.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RowError {
    /// Whether this error must stop the whole job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(StoreError::Unavailable(_)))
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// =============================================================================
// Import Errors (job-fatal)
// =============================================================================

/// Errors that terminate an import job.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The upload could not be parsed.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// A required column is absent from the header.
    #[error("Missing required column '{0}'")]
    MissingColumn(String),

    /// The job ran past its deadline.
    #[error("Import exceeded its deadline of {0:?}")]
    Timeout(std::time::Duration),

    /// The caller cancelled the job.
    #[error("Import cancelled")]
    Cancelled,

    /// The database became unreachable.
    #[error("Lost database connectivity: {0}")]
    Connectivity(String),

    /// The configuration cannot be used.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A fatal job error with everything accumulated before it happened.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct JobFailure {
    #[source]
    pub error: ImportError,
    pub partial: ImportSummary,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for parsing.
pub type ParseResult<T> = Result<T, ParseError>;

/// Result type for repository calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for per-row service calls.
pub type RowResult<T> = Result<T, RowError>;

/// Result type for whole-job operations.
pub type JobResult<T> = Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldError;

    #[test]
    fn test_unavailable_store_error_is_fatal() {
        let err: RowError = StoreError::Unavailable("pool closed".into()).into();
        assert!(err.is_fatal());

        let err: RowError = StoreError::Transient("deadlock".into()).into();
        assert!(!err.is_fatal());
        assert!(!RowError::BlacklistedDomain("spam.test".into()).is_fatal());
    }

    #[test]
    fn test_validation_error_joins_fields() {
        let err = RowError::Validation(vec![
            FieldError::error("work_email", "Email is empty"),
            FieldError::error("work_phone", "Phone number must have 7 to 15 digits"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("work_email: Email is empty"));
        assert!(msg.contains("; work_phone:"));
    }

    #[test]
    fn test_parse_error_converts_to_import_error() {
        let err: ImportError = ParseError::EmptyHeader.into();
        assert!(err.to_string().contains("header"));
        assert_eq!(
            ParseError::Malformed { line: 7, message: "x".into() }.line(),
            Some(7)
        );
    }
}
