//! Core run lifecycle machinery.
//!
//! This module contains:
//! - EventLog: Append-only per-run journal with live fan-out
//! - ArtifactStore: Run-scoped artifact persistence
//! - StateStore: Workflow state document
//! - CancellationToken: Cooperative abort signal
//! - RunCoordinator: One phase, one run, canonical event envelope
//! - JobRegistry: Concurrent jobs, input collection, streaming, cancellation

pub mod artifact_store;
pub mod cancellation;
pub mod coordinator;
pub mod event_log;
pub mod registry;
pub mod state_store;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export commonly used types
pub use artifact_store::{sha256_hex, ArtifactStore, URI_SCHEME};
pub use cancellation::CancellationToken;
pub use coordinator::{RunContext, RunCoordinator, RunResult};
pub use event_log::{replay_file, EventCallback, EventLog, Subscription, EVENTS_FILE};
pub use registry::{
    sse_frame, EventStream, FetchResult, JobHandle, JobOutcome, JobRegistry, JobStatus,
    RegistrySettings, StartRequest,
};
pub use state_store::{iso_timestamp, StateStore, WorkflowInit, WorkflowState, STATE_FILE};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
