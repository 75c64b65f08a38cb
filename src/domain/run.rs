//! Run identity, lifecycle status, and reconstruction from the journal.
//!
//! A Run is one execution attempt of one workflow phase.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{EndStatus, Event, EventKind, PhaseStatus};

/// Opaque run identifier: 32 lowercase hex characters, safe as a directory name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this looks like an identifier produced by [`RunId::generate`]
    pub fn is_well_formed(value: &str) -> bool {
        value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for required inputs
    PendingInputs,

    /// Phase executor launched
    Running,

    /// Terminal: finished successfully
    Completed,

    /// Terminal: cooperative abort
    Cancelled,

    /// Terminal: failed
    Errored,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Errored
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::PendingInputs => "pending_inputs",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Errored => "errored",
        }
    }
}

impl From<EndStatus> for RunStatus {
    fn from(status: EndStatus) -> Self {
        match status {
            EndStatus::Ok | EndStatus::Partial => RunStatus::Completed,
            EndStatus::Error => RunStatus::Errored,
            EndStatus::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// A run's state as reconstructed from its journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,

    /// Timestamp of the first journaled event
    pub created_at: DateTime<Utc>,

    /// Timestamp of the terminal event, if any
    pub finished_at: Option<DateTime<Utc>>,

    pub status: RunStatus,

    /// Phase named by the most recent phase event
    pub phase: Option<String>,

    /// Locators (or paths when no locator was recorded) of announced artifacts
    pub artifacts: Vec<String>,

    /// Last failure message, if any
    pub error: Option<String>,

    pub elapsed_ms: Option<u64>,

    pub event_count: usize,
}

impl RunSummary {
    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut summary = Self {
            run_id: first.run_id.clone(),
            created_at: first.ts,
            finished_at: None,
            status: RunStatus::PendingInputs,
            phase: None,
            artifacts: Vec::new(),
            error: None,
            elapsed_ms: None,
            event_count: 0,
        };

        for event in events {
            summary.apply_event(event);
        }

        Some(summary)
    }

    /// Apply a single event to update the reconstructed state
    pub fn apply_event(&mut self, event: &Event) {
        self.event_count += 1;

        match &event.kind {
            EventKind::Phase { phase, status, .. } => {
                self.phase = Some(phase.clone());
                if *status == PhaseStatus::Start && !self.status.is_terminal() {
                    self.status = RunStatus::Running;
                }
            }
            EventKind::Artifact { uri, path, .. } => {
                self.artifacts.push(uri.clone().unwrap_or_else(|| path.clone()));
            }
            EventKind::Error { message, .. } => {
                self.error = Some(message.clone());
            }
            EventKind::End {
                status, elapsed_ms, ..
            } => {
                self.status = (*status).into();
                self.finished_at = Some(event.ts);
                self.elapsed_ms = *elapsed_ms;
            }
            _ => {}
        }
    }
}
