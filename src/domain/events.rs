//! Event types for the run journal and live streams.
//!
//! Every event carries the run identifier, a timestamp, and a per-run
//! sequence number. The kind-specific payload is a tagged enum so each
//! kind only carries the fields that matter for it; on the wire the tag
//! is the `event` field of a flat JSON object.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::run::RunId;

/// A single event in a run's append-only journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The run this event belongs to (stamped by the event log)
    pub run_id: RunId,

    /// When this event occurred (ISO 8601)
    pub ts: DateTime<Utc>,

    /// Position in the run's journal. Assigned by the event log when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Create an event with the current timestamp and no sequence number
    pub fn new(run_id: RunId, kind: EventKind) -> Self {
        Self {
            run_id,
            ts: Utc::now(),
            seq: None,
            kind,
        }
    }

    /// Pre-assign a sequence number (used when replaying historical events)
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// The wire label of this event's kind
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    /// True for the `end` event that closes a run's stream
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::End { .. })
    }

    /// Render as a server-sent-events frame: `event: <kind>\ndata: <json>\n\n`
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.label(), data)
    }
}

/// Kind-specific event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// A phase started or ended
    Phase {
        phase: String,
        status: PhaseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },

    /// Streamed text from an agent
    Token {
        agent: String,
        channel: TokenChannel,
        text: String,
    },

    /// Tool invocation lifecycle
    Tool {
        name: String,
        status: ToolStatus,
        #[serde(default)]
        args: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    /// An artifact has been persisted
    Artifact {
        artifact_type: String,
        path: String,
        sha256: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// The input bag accumulated so far and the keys still outstanding
    Answers {
        answers: BTreeMap<String, String>,
        missing: Vec<String>,
    },

    /// The run is waiting for inputs
    Prompt {
        questions: Vec<Question>,
        missing: Vec<String>,
    },

    /// Human-readable summary of the collected inputs
    Summary { summary: String },

    /// An elicitation method was applied before execution
    Elicitation {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// Failure signal
    Error {
        #[serde(rename = "where")]
        source: ErrorSource,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    /// Terminal run status
    End {
        status: EndStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<Value>,
    },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Phase { .. } => "phase",
            EventKind::Token { .. } => "token",
            EventKind::Tool { .. } => "tool",
            EventKind::Artifact { .. } => "artifact",
            EventKind::Answers { .. } => "answers",
            EventKind::Prompt { .. } => "prompt",
            EventKind::Summary { .. } => "summary",
            EventKind::Elicitation { .. } => "elicitation",
            EventKind::Error { .. } => "error",
            EventKind::End { .. } => "end",
        }
    }

    pub fn phase_start(phase: impl Into<String>) -> Self {
        EventKind::Phase {
            phase: phase.into(),
            status: PhaseStatus::Start,
            meta: None,
        }
    }

    pub fn phase_end(phase: impl Into<String>) -> Self {
        EventKind::Phase {
            phase: phase.into(),
            status: PhaseStatus::End,
            meta: None,
        }
    }

    pub fn end(status: EndStatus) -> Self {
        EventKind::End {
            status,
            elapsed_ms: None,
            summary: None,
        }
    }

    pub fn error(source: ErrorSource, message: impl Into<String>, retryable: bool) -> Self {
        EventKind::Error {
            source,
            message: message.into(),
            retryable,
            details: None,
        }
    }
}

/// A question shown to the caller while a run waits for inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub number: u32,
    pub key: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenChannel {
    Stdout,
    Stderr,
    Thought,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Call,
    Result,
    Error,
}

/// Where a failure was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Runner,
    Executor,
    Agent,
    Tool,
    System,
}

/// Terminal status carried by the `end` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndStatus {
    Ok,
    Partial,
    Error,
    Cancelled,
}

impl EndStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndStatus::Ok => "ok",
            EndStatus::Partial => "partial",
            EndStatus::Error => "error",
            EndStatus::Cancelled => "cancelled",
        }
    }
}
