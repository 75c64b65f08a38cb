//! arcindex - Run-lifecycle coordinator for streamed workflow phases
//!
//! Executes one workflow phase per run, streams structured progress events
//! to any number of observers, persists phase outputs as content-addressed
//! artifacts, and records durable workflow state.
//!
//! # Architecture
//!
//! Each run owns an append-only event journal:
//! - Events are sequence-numbered and written to `runs/<run_id>/logs/events.ndjson`
//! - Live subscribers see events in journal order
//! - Run status is reconstructed by replaying the journal
//!
//! # Modules
//!
//! - `core`: EventLog, ArtifactStore, StateStore, RunCoordinator, JobRegistry
//! - `domain`: Data structures (Event, RunId, ArtifactRecord)
//! - `phases`: Phase executors (built-in discovery phase)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the discovery phase, answering questions on stdin
//! arcindex run --project "My Project"
//!
//! # Check run status
//! arcindex status <run-id>
//!
//! # Replay a run as server-sent events
//! arcindex events <run-id> --sse
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod phases;

// Re-export main types at crate root for convenience
pub use crate::core::{
    CancellationToken, JobRegistry, JobStatus, RegistrySettings, RunContext, RunCoordinator,
    StartRequest,
};
pub use domain::{Event, EventKind, RunId, RunStatus};
pub use error::{Result, RunError};
pub use phases::{PhaseCatalog, PhaseExecutor, PhaseOutput};
