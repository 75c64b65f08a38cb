//! Error taxonomy shared by the run coordinator, stores, and job registry.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while creating, driving, or persisting a run
#[derive(Debug, Error)]
pub enum RunError {
    /// Workflow state was requested before it was created
    #[error("Workflow state has not been initialized: {}", .0.display())]
    NotInitialized(PathBuf),

    /// Unknown run identifier
    #[error("Run not found: {0}")]
    NotFound(String),

    /// Another job is already driving this workflow
    #[error("Workflow '{0}' already has an active run")]
    AlreadyActive(String),

    /// Cooperative abort requested through the run's cancellation token
    #[error("Run cancelled")]
    Cancelled,

    /// The phase executor raised
    #[error("Phase executor failed: {0:#}")]
    Executor(#[source] anyhow::Error),

    /// Durable write or read failed in the event log, artifact store, or state store
    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid artifact path component: {0:?}")]
    InvalidArtifactPath(String),

    #[error("Invalid elicitation selection: {0}")]
    InvalidElicitation(u32),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    /// Workflow ids name a directory under the state root
    #[error("Invalid workflow id: {0:?}")]
    InvalidWorkflowId(String),
}

impl RunError {
    /// Wrap an executor failure, keeping crate errors that travelled through `anyhow`
    /// (cancellation, persistence) in their own variant.
    pub fn from_executor(err: anyhow::Error) -> Self {
        match err.downcast::<RunError>() {
            Ok(run_error) => run_error,
            Err(other) => RunError::Executor(other),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }
}

pub type Result<T, E = RunError> = std::result::Result<T, E>;

/// Attach a human-readable context to an I/O failure
pub(crate) trait PersistContext<T> {
    fn persist_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> PersistContext<T> for std::io::Result<T> {
    fn persist_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| RunError::Persistence {
            context: context(),
            source,
        })
    }
}

pub(crate) fn serialization_error(what: impl Into<String>) -> impl FnOnce(serde_json::Error) -> RunError {
    let what = what.into();
    move |source| RunError::Serialization { what, source }
}
