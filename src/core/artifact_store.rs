//! Run-scoped artifact storage.
//!
//! Artifacts are written beneath `runs/<run_id>/artifacts/[phase]/[agent]/`
//! and referenced through `arc://runs/<run_id>/<relative_path>` locators so
//! downstream consumers can resolve them without guessing paths. The path is
//! a pure function of the artifact's type, phase, agent, and extension, so a
//! repeated write overwrites the previous blob in place.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use crate::domain::{ArtifactOptions, ArtifactRecord, RunId};
use crate::error::{serialization_error, PersistContext, Result, RunError};

/// Locator scheme for artifacts
pub const URI_SCHEME: &str = "arc";

/// Artifact persistence for a single run
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_id: RunId,
    run_dir: PathBuf,
}

impl ArtifactStore {
    /// Open the store, creating `runs/<run_id>/{artifacts,logs}` if absent
    pub async fn open(run_id: RunId, runs_root: &Path) -> Result<Self> {
        let run_dir = runs_root.join(run_id.as_str());

        for dir in [run_dir.join("artifacts"), run_dir.join("logs")] {
            fs::create_dir_all(&dir)
                .await
                .persist_context(|| format!("Failed to create run directory: {}", dir.display()))?;
        }

        Ok(Self { run_id, run_dir })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Absolute path to the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Write a UTF-8 text artifact (default `.md`, `text/markdown`)
    pub async fn write_text(
        &self,
        artifact_type: &str,
        content: &str,
        options: ArtifactOptions,
    ) -> Result<ArtifactRecord> {
        let options = ArtifactOptions {
            extension: options.extension.or_else(|| Some(".md".to_string())),
            mime_type: options.mime_type.or_else(|| Some("text/markdown".to_string())),
            ..options
        };
        self.write_bytes(artifact_type, content.as_bytes(), options).await
    }

    /// Write a JSON artifact, pretty-printed with sorted keys (default `.json`)
    pub async fn write_json<T>(
        &self,
        artifact_type: &str,
        document: &T,
        options: ArtifactOptions,
    ) -> Result<ArtifactRecord>
    where
        T: Serialize + ?Sized,
    {
        // Round-trip through Value: its map type orders keys
        let value = serde_json::to_value(document).map_err(serialization_error(artifact_type))?;
        let text = serde_json::to_string_pretty(&value).map_err(serialization_error(artifact_type))?;

        let options = ArtifactOptions {
            extension: options.extension.or_else(|| Some(".json".to_string())),
            mime_type: options
                .mime_type
                .or_else(|| Some("application/json".to_string())),
            ..options
        };
        self.write_bytes(artifact_type, text.as_bytes(), options).await
    }

    /// Write arbitrary bytes
    pub async fn write_bytes(
        &self,
        artifact_type: &str,
        bytes: &[u8],
        options: ArtifactOptions,
    ) -> Result<ArtifactRecord> {
        let extension = options.extension.as_deref().unwrap_or("");
        let relative = relative_path(
            artifact_type,
            extension,
            options.phase.as_deref(),
            options.agent.as_deref(),
        )?;

        let path = relative
            .split('/')
            .fold(self.run_dir.clone(), |acc, part| acc.join(part));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .persist_context(|| format!("Failed to create artifact directory: {}", parent.display()))?;
        }

        fs::write(&path, bytes)
            .await
            .persist_context(|| format!("Failed to write artifact: {}", path.display()))?;

        let record = ArtifactRecord {
            artifact_type: artifact_type.to_string(),
            path,
            uri: self.uri_for(&relative),
            sha256: sha256_hex(bytes),
            phase: options.phase,
            agent: options.agent,
            mime_type: options.mime_type,
            metadata: options.metadata,
        };
        debug!(run_id = %self.run_id, uri = %record.uri, bytes = bytes.len(), "Artifact written");

        Ok(record)
    }

    /// Locator for a path relative to the run directory
    pub fn uri_for(&self, relative: &str) -> String {
        format!("{}://runs/{}/{}", URI_SCHEME, self.run_id, relative)
    }

    /// Map a locator belonging to this run back to its absolute path
    pub fn resolve(&self, uri: &str) -> Option<PathBuf> {
        let prefix = format!("{}://runs/{}/", URI_SCHEME, self.run_id);
        let relative = uri.strip_prefix(&prefix)?;
        if relative.is_empty() || relative.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return None;
        }
        Some(
            relative
                .split('/')
                .fold(self.run_dir.clone(), |acc, part| acc.join(part)),
        )
    }

    /// Load an artifact's bytes by locator
    pub async fn read(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.resolve(uri) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path)
            .await
            .map(Some)
            .persist_context(|| format!("Failed to read artifact: {}", path.display()))
    }
}

/// Relative path (forward slashes) for an artifact:
/// `artifacts/[phase]/[agent]/{type}{extension}`
pub fn relative_path(
    artifact_type: &str,
    extension: &str,
    phase: Option<&str>,
    agent: Option<&str>,
) -> Result<String> {
    let mut components = vec!["artifacts".to_string()];
    for component in [phase, agent].into_iter().flatten() {
        if let Some(normalized) = normalize_component(component) {
            ensure_safe(&normalized)?;
            components.push(normalized);
        }
    }

    let file_name = format!("{}{}", artifact_type, extension);
    if artifact_type.trim().is_empty() {
        return Err(RunError::InvalidArtifactPath(artifact_type.to_string()));
    }
    ensure_safe(&file_name)?;
    components.push(file_name);

    Ok(components.join("/"))
}

/// Trim and replace spaces with hyphens; empty results are omitted
fn normalize_component(value: &str) -> Option<String> {
    let sanitized = value.trim().replace(' ', "-");
    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

fn ensure_safe(component: &str) -> Result<()> {
    if component == "." || component == ".." || component.contains(['/', '\\']) {
        return Err(RunError::InvalidArtifactPath(component.to_string()));
    }
    Ok(())
}

/// SHA-256 of `bytes` as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
