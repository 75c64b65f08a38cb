//! Domain types for the run coordinator.
//!
//! This module contains the core data structures:
//! - Events: Immutable, sequence-numbered journal records
//! - Run: Run identity and lifecycle status
//! - Artifact: Persisted phase outputs

pub mod artifact;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use artifact::{ArtifactOptions, ArtifactRecord};
pub use events::{
    EndStatus, ErrorSource, Event, EventKind, PhaseStatus, Question, TokenChannel, ToolStatus,
};
pub use run::{RunId, RunStatus, RunSummary};
