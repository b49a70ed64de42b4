//! # Onboard - bulk affiliate member onboarding
//!
//! Onboard reads a spreadsheet export of affiliate members, cleans every
//! row, upserts the member, provisions or links its login account and
//! grants default roles. Bad rows are reported, never fatal.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   CSV File  │────▶│   Parser    │────▶│   Chunks    │────▶│   Summary   │
//! │   (UTF-8)   │     │ (auto-delim)│     │ clean/member│     │  (report)   │
//! └─────────────┘     └─────────────┘     │ user/roles  │     └─────────────┘
//!                                         └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use onboard::{ImportConfig, ImportOrchestrator, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::with_roles(["member", "retiree"]));
//!     let orchestrator = ImportOrchestrator::from_store(&ImportConfig::default(), store).unwrap();
//!     let file = std::fs::File::open("members.csv").unwrap();
//!     let summary = orchestrator.run(file, 200).await.unwrap();
//!     println!("{} created, {} failed", summary.created, summary.failed);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Hierarchical error types
//! - [`models`] - Rows, members, users, roles, results
//! - [`parser`] - Streaming CSV parsing with delimiter detection
//! - [`cleaner`] - Row normalization and validation
//! - [`services`] - Member, user and role services
//! - [`pipeline`] - Chunk processor and orchestrator
//! - [`summary`] - Outcome accumulation and the report
//! - [`store`] - Repository traits, in-memory and Postgres stores
//! - [`config`] - Job configuration
//! - [`events`] - Progress broadcasting
//! - [`retry`] - Transient error retry policy

// Core modules
pub mod error;
pub mod models;

// Ingestion
pub mod cleaner;
pub mod parser;

// Persistence
pub mod retry;
pub mod services;
pub mod store;

// Jobs
pub mod config;
pub mod events;
pub mod pipeline;
pub mod summary;

// =============================================================================
// Re-exports - Error types
// =============================================================================

pub use error::{
    ImportError,
    JobFailure,
    JobResult,
    ParseError,
    ParseResult,
    RowError,
    StoreError,
};

// =============================================================================
// Re-exports - Models
// =============================================================================

pub use models::{
    CleanedRow,
    EmploymentStatus,
    FieldError,
    ImportResult,
    ImportStatus,
    Member,
    RawRow,
    Role,
    User,
    UserStatus,
};

// =============================================================================
// Re-exports - Parsing and cleaning
// =============================================================================

pub use cleaner::{DataCleaner, DomainBlacklist, DomainValidator};
pub use parser::{detect_delimiter, CsvParser, RowStream};

// =============================================================================
// Re-exports - Services and stores
// =============================================================================

pub use retry::RetryPolicy;
pub use services::{
    MemberService,
    RoleAssignmentService,
    RoleMap,
    UserImportService,
};
pub use store::{MemberRepository, MemoryStore, PgStore, RoleRepository, UserRepository};

// =============================================================================
// Re-exports - Jobs
// =============================================================================

pub use config::{ImportConfig, JobLimits};
pub use events::{ImportEvent, ProgressBroadcaster};
pub use pipeline::{CancellationToken, ChunkProcessor, ImportOrchestrator, RunOptions};
pub use summary::{ErrorSample, ImportReport, ImportSummary, SummaryAccumulator};
