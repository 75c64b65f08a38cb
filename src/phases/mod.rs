//! Phase executors.
//!
//! A phase executor turns a run context plus the collected input bag into a
//! summary, artifacts, and state updates. The coordinator owns everything
//! around that call: lifecycle events, cancellation checkpoints, and state
//! persistence.

pub mod discovery;
pub mod elicitation;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::RunContext;
use crate::domain::{ArtifactRecord, Question};
use crate::error::RunError;

pub use discovery::DiscoveryPhase;
pub use elicitation::{ElicitationMenu, ElicitationOption};

/// Input bag collected from the caller: answer key → text
pub type Inputs = BTreeMap<String, String>;

/// What a phase executor hands back on success
#[derive(Debug, Clone, Default)]
pub struct PhaseOutput {
    /// Human-readable summary (also carried by the terminal `end` event)
    pub summary: String,

    /// Artifacts produced; any not written through the run context are
    /// announced by the coordinator after `phase:end`
    pub artifacts: Vec<ArtifactRecord>,

    /// State section the fields below are merged into
    pub state_section: Option<String>,

    pub state_fields: Map<String, Value>,
}

impl PhaseOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, record: ArtifactRecord) -> Self {
        self.artifacts.push(record);
        self
    }

    pub fn with_state(mut self, section: impl Into<String>, fields: Map<String, Value>) -> Self {
        self.state_section = Some(section.into());
        self.state_fields = fields;
        self
    }
}

/// Trait for phase implementations
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Phase identifier (`discovery`, `analyst`, ...)
    fn phase(&self) -> &str;

    /// Phase the workflow advances to once this one completes
    fn next_phase(&self) -> Option<&str> {
        None
    }

    /// Questions whose answers must be collected before the phase can run
    fn questionnaire(&self, project_name: Option<&str>) -> Vec<Question>;

    /// Short preview of the collected inputs, shown before execution starts
    fn preview(&self, inputs: &Inputs, project_name: Option<&str>) -> String;

    /// Run the phase
    async fn execute(&self, ctx: &RunContext, inputs: &Inputs) -> Result<PhaseOutput>;
}

/// Registry of available phase executors keyed by phase id
#[derive(Clone, Default)]
pub struct PhaseCatalog {
    executors: HashMap<String, Arc<dyn PhaseExecutor>>,
}

impl PhaseCatalog {
    /// Phase used when neither the caller nor the workflow state names one
    pub const DEFAULT_PHASE: &'static str = "discovery";

    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every built-in phase registered
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(DiscoveryPhase::new()));
        catalog
    }

    /// Add or replace the executor for its phase id
    pub fn register(&mut self, executor: Arc<dyn PhaseExecutor>) {
        self.executors.insert(executor.phase().to_string(), executor);
    }

    pub fn get(&self, phase: &str) -> crate::error::Result<Arc<dyn PhaseExecutor>> {
        self.executors
            .get(phase)
            .cloned()
            .ok_or_else(|| RunError::UnknownPhase(phase.to_string()))
    }

    /// Registered phase ids, sorted
    pub fn phases(&self) -> Vec<String> {
        let mut phases: Vec<String> = self.executors.keys().cloned().collect();
        phases.sort();
        phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = PhaseCatalog::with_builtin();
        assert_eq!(catalog.phases(), vec!["discovery".to_string()]);

        let discovery = catalog.get(PhaseCatalog::DEFAULT_PHASE).unwrap();
        assert_eq!(discovery.next_phase(), Some("analyst"));

        assert!(matches!(
            catalog.get("architect"),
            Err(RunError::UnknownPhase(phase)) if phase == "architect"
        ));
    }
}
