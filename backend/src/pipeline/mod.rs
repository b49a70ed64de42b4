//! The import job.
//!
//! ```text
//! reader ─▶ CsvParser ─▶ chunks of RawRow ─▶ ChunkProcessor ─▶ SummaryAccumulator
//!                                             clean → member → user → roles
//! ```
//!
//! [`ImportOrchestrator`] owns the chunk loop, the deadline and cancellation;
//! [`ChunkProcessor`] owns per-row isolation.

pub mod chunk;
pub mod orchestrator;

pub use chunk::ChunkProcessor;
pub use orchestrator::{ImportOrchestrator, RunOptions};
pub use tokio_util::sync::CancellationToken;
