//! Workflow state persistence.
//!
//! Each workflow owns one JSON document at
//! `<state_root>/<workflow_id>/workflow.json`. The document is always a
//! superset of the workflow template: defaults are back-filled when it is
//! initialized and again when it is loaded. Saves replace the whole file via
//! write-temp-then-rename, so a concurrent reader never sees a partial write.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{serialization_error, PersistContext, Result, RunError};

/// State file name inside a workflow's directory
pub const STATE_FILE: &str = "workflow.json";

const BUILTIN_TEMPLATE: &str = include_str!("../../resources/workflow_template.json");

/// Render a timestamp the way the state document stores them (`2025-10-14T12:00:00Z`)
pub fn iso_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn builtin_template() -> Map<String, Value> {
    serde_json::from_str(BUILTIN_TEMPLATE).unwrap_or_default()
}

/// The mutable cross-phase progress document for one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowState(Map<String, Value>);

impl WorkflowState {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.get("workflow_id").and_then(Value::as_str)
    }

    pub fn current_phase(&self) -> Option<&str> {
        self.get("current_phase").and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.get("status").and_then(Value::as_str)
    }

    pub fn completed_phases(&self) -> Vec<String> {
        self.get("completed_phases")
            .and_then(Value::as_array)
            .map(|phases| {
                phases
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mutable access to an object-valued key, replacing a non-object value
    pub fn section_mut(&mut self, key: &str) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("section was just made an object"),
        }
    }

    /// Mutable access to an array-valued key, replacing a non-array value
    pub fn list_mut(&mut self, key: &str) -> &mut Vec<Value> {
        let entry = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        match entry {
            Value::Array(items) => items,
            _ => unreachable!("list was just made an array"),
        }
    }

    /// Merge phase-specific fields into an object-valued section
    pub fn merge_section(&mut self, section: &str, fields: Map<String, Value>) {
        self.section_mut(section).extend(fields);
    }

    /// Mark `phase` complete and hand off to `next` (or close the workflow)
    pub fn complete_phase(&mut self, phase: &str, next: Option<&str>, ts: DateTime<Utc>) {
        let timestamp = iso_timestamp(ts);

        self.section_mut("elicitation_completed")
            .insert(phase.to_string(), Value::Bool(true));

        let completed = self.list_mut("completed_phases");
        if !completed.iter().any(|p| p.as_str() == Some(phase)) {
            completed.push(json!(phase));
        }

        match next {
            Some(next) => {
                self.insert("current_phase", json!(next));
                let agent_context = self.section_mut("agent_context");
                agent_context.insert("current_agent".to_string(), json!(next));
                agent_context.insert("last_transformation".to_string(), json!(timestamp));
                let history = agent_context
                    .entry("transformation_history".to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(items) = history {
                    items.push(json!({
                        "from": phase,
                        "to": next,
                        "timestamp": timestamp,
                        "context_passed": { phase: true },
                    }));
                }
            }
            None => {
                self.insert("status", json!("completed"));
            }
        }

        self.record_quality_gate_placeholder(phase);
        self.insert("last_updated", json!(timestamp));
    }

    /// Record a `NOT_RUN` quality gate result for `phase`
    pub fn record_quality_gate_placeholder(&mut self, phase: &str) {
        self.section_mut("quality_gate_results").insert(
            phase.to_string(),
            json!({
                "timestamp": null,
                "status": "NOT_RUN",
                "score": null,
                "checklist": format!("legacy/.codex/checklists/{}-quality-gate.md", phase),
                "mode": "auto",
                "summary": null,
                "total_items": null,
                "items_passed": null,
                "items_failed": null,
                "critical_failures": null,
                "standard_failures": null,
            }),
        );
    }

    /// Append an elicitation selection to the history log
    pub fn record_elicitation(&mut self, phase: &str, number: u32, label: &str, ts: DateTime<Utc>) {
        self.list_mut("elicitation_history").push(json!({
            "phase": phase,
            "timestamp": iso_timestamp(ts),
            "method_selected": format!("{}. {}", number, label),
            "user_response": null,
            "applied_changes": null,
        }));
    }

    /// Insert every template key that is missing, recursing into objects
    pub fn back_fill(&mut self, template: &Map<String, Value>) {
        back_fill_map(&mut self.0, template);
    }
}

fn back_fill_map(target: &mut Map<String, Value>, template: &Map<String, Value>) {
    for (key, default) in template {
        match target.get_mut(key) {
            None => {
                target.insert(key.clone(), default.clone());
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(nested) = default {
                    back_fill_map(existing, nested);
                }
            }
            Some(_) => {}
        }
    }
}

/// Parameters for creating a new workflow document
#[derive(Debug, Clone)]
pub struct WorkflowInit {
    pub workflow_id: String,
    pub workflow_type: String,
    pub project_name: Option<String>,
    pub operation_mode: String,
    pub starting_phase: String,
    pub timestamp: DateTime<Utc>,
}

/// Read/write access to one workflow's state document
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
    state_path: PathBuf,
    template: Map<String, Value>,
}

impl StateStore {
    /// Store rooted at `state_dir`, using the built-in template
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            state_path: state_dir.join(STATE_FILE),
            state_dir,
            template: builtin_template(),
        }
    }

    /// Store for `workflow_id` beneath the shared state root.
    ///
    /// The id must be a single path component.
    pub fn for_workflow(state_root: &Path, workflow_id: &str) -> Result<Self> {
        if workflow_id.trim().is_empty()
            || workflow_id == "."
            || workflow_id == ".."
            || workflow_id.contains(['/', '\\', '\0'])
        {
            return Err(RunError::InvalidWorkflowId(workflow_id.to_string()));
        }
        Ok(Self::new(state_root.join(workflow_id)))
    }

    /// Replace the template with one read from disk
    pub async fn with_template_file(mut self, path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .persist_context(|| format!("Failed to read workflow template: {}", path.display()))?;
        self.template = serde_json::from_str(&content)
            .map_err(serialization_error(format!("workflow template {}", path.display())))?;
        Ok(self)
    }

    /// Location of the workflow state file
    pub fn path(&self) -> &Path {
        &self.state_path
    }

    pub fn template(&self) -> &Map<String, Value> {
        &self.template
    }

    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    /// Load the persisted document, back-filling template defaults
    pub async fn load(&self) -> Result<WorkflowState> {
        if !self.exists() {
            return Err(RunError::NotInitialized(self.state_path.clone()));
        }

        let content = fs::read_to_string(&self.state_path)
            .await
            .persist_context(|| format!("Failed to read workflow state: {}", self.state_path.display()))?;
        let mut state: WorkflowState =
            serde_json::from_str(&content).map_err(serialization_error("workflow state"))?;
        state.back_fill(&self.template);

        Ok(state)
    }

    /// Atomically replace the persisted document with `state`
    pub async fn save(&self, state: &WorkflowState) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .await
            .persist_context(|| format!("Failed to create state directory: {}", self.state_dir.display()))?;

        let content =
            serde_json::to_string_pretty(state).map_err(serialization_error("workflow state"))?;

        let temp_path = self
            .state_dir
            .join(format!(".{}.{}.tmp", STATE_FILE, Uuid::new_v4().simple()));

        if let Err(err) = write_synced(&temp_path, content.as_bytes()).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(source) = fs::rename(&temp_path, &self.state_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(RunError::Persistence {
                context: format!("Failed to replace workflow state: {}", self.state_path.display()),
                source,
            });
        }

        debug!(path = %self.state_path.display(), "Workflow state saved");
        Ok(())
    }

    /// Create a new document from the template and persist it
    pub async fn initialize(&self, init: &WorkflowInit) -> Result<WorkflowState> {
        let mut state = WorkflowState::from_map(self.template.clone());
        let timestamp = iso_timestamp(init.timestamp);
        let phase = init.starting_phase.as_str();

        state.insert("workflow_id", json!(init.workflow_id));
        state.insert("workflow_type", json!(init.workflow_type));
        state.insert("project_name", json!(init.project_name));
        state.insert("current_phase", json!(phase));
        state.insert("completed_phases", json!([]));
        state.insert("operation_mode", json!(init.operation_mode));
        state.insert("mode_initialized_at", json!(timestamp));
        state.insert("started_at", json!(timestamp));
        state.insert("last_updated", json!(timestamp));
        state.insert("status", json!("active"));

        state.section_mut("project_discovery").extend(
            [
                ("project_name", json!(init.project_name)),
                ("project_concept", Value::Null),
                ("existing_inputs", Value::Null),
                ("discovery_timestamp", json!(timestamp)),
                ("discovery_completed", json!(false)),
                ("discovery_summary_path", Value::Null),
                ("project_scope", Value::Null),
                ("target_users", Value::Null),
                ("user_research_status", Value::Null),
                ("competitive_landscape", Value::Null),
                ("market_opportunities", Value::Null),
                ("technical_constraints", Value::Null),
                ("integration_requirements", Value::Null),
                ("success_criteria", Value::Null),
                ("business_goals", Value::Null),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v)),
        );

        let agent_context = state.section_mut("agent_context");
        agent_context.insert("current_agent".to_string(), json!(phase));
        agent_context.insert("transformation_history".to_string(), json!([]));
        agent_context.insert("last_transformation".to_string(), json!(timestamp));

        state
            .section_mut("elicitation_required")
            .entry(phase.to_string())
            .or_insert(json!(true));
        state
            .section_mut("elicitation_completed")
            .insert(phase.to_string(), json!(false));

        state.record_quality_gate_placeholder(phase);
        state.back_fill(&self.template);

        self.save(&state).await?;
        Ok(state)
    }

    /// Update `last_updated` in memory and on disk
    pub async fn touch(&self, state: &mut WorkflowState, ts: DateTime<Utc>) -> Result<()> {
        state.insert("last_updated", json!(iso_timestamp(ts)));
        self.save(state).await
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let context = || format!("Failed to write workflow state: {}", path.display());
    let mut file = fs::File::create(path).await.persist_context(context)?;
    file.write_all(bytes).await.persist_context(context)?;
    file.sync_all().await.persist_context(context)?;
    Ok(())
}
