//! Artifacts produced by phase executors.
//!
//! An artifact is an immutable byte blob written beneath the run directory,
//! addressed by its SHA-256 digest and a deterministic locator.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::EventKind;

/// A persisted artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Artifact type tag (also the file stem)
    pub artifact_type: String,

    /// Absolute on-disk path
    pub path: PathBuf,

    /// Stable locator: `arc://runs/{run_id}/{relative_path}`
    pub uri: String,

    /// SHA-256 of the exact bytes written (lowercase hex)
    pub sha256: String,

    pub phase: Option<String>,
    pub agent: Option<String>,
    pub mime_type: Option<String>,
    pub metadata: Option<Value>,
}

impl ArtifactRecord {
    /// Payload for the `artifact` event announcing this record
    pub fn to_event(&self) -> EventKind {
        EventKind::Artifact {
            artifact_type: self.artifact_type.clone(),
            path: self.path.display().to_string(),
            sha256: self.sha256.clone(),
            phase: self.phase.clone().filter(|p| !p.is_empty()),
            agent: self.agent.clone().filter(|a| !a.is_empty()),
            uri: Some(self.uri.clone()),
            mime_type: self.mime_type.clone(),
            metadata: self.metadata.clone().filter(|m| !is_empty_object(m)),
        }
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().map(|o| o.is_empty()).unwrap_or(false)
}

/// Optional tags and placement for an artifact write
#[derive(Debug, Clone, Default)]
pub struct ArtifactOptions {
    pub phase: Option<String>,
    pub agent: Option<String>,
    /// File extension including the dot; each writer has its own default
    pub extension: Option<String>,
    pub mime_type: Option<String>,
    pub metadata: Option<Value>,
}

impl ArtifactOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
