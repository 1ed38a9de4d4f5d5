//! Migration engine for moving agent memory between memory service instances.
//!
//! Exports an agent's core blocks, archival records, recall history and tool
//! definitions into a self-describing snapshot file, imports that file into
//! another instance idempotently and resumably, and verifies live state
//! against a snapshot.

pub mod builder;
pub mod exit;
pub mod format;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod verify;

pub use exit::ExitStatus;
pub use orchestrator::{ImportOptions, Orchestrator};
pub use report::{ExportFailure, ExportReport, HealthReport, ImportOutcome, ImportReport};
pub use verify::{Against, VerificationReport};
