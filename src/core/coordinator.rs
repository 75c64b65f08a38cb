//! Run lifecycle coordinator.
//!
//! Drives exactly one phase for one run and wraps the executor call in the
//! canonical event envelope:
//!
//! ```text
//! phase:start → (executor events, artifacts) → phase:end → artifact* → end:ok
//!                                          └─ cancelled → end:cancelled
//!                                          └─ failure   → error → end:error
//! ```
//!
//! Cancellation is cooperative. The token is checked before the executor is
//! invoked and again before its results are committed; a cancel requested
//! while the executor is running is only observed once it returns.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::domain::{
    ArtifactOptions, ArtifactRecord, EndStatus, ErrorSource, Event, EventKind, RunId,
};
use crate::error::{Result, RunError};
use crate::phases::{Inputs, PhaseExecutor, PhaseOutput};

use super::artifact_store::ArtifactStore;
use super::cancellation::CancellationToken;
use super::event_log::{EventCallback, EventLog, Subscription};
use super::lock;
use super::state_store::{StateStore, WorkflowState};

/// Executor-facing handle for one run: event emission, artifact writes, and
/// the cancellation signal.
pub struct RunContext {
    run_id: RunId,
    phase: String,
    created_at: DateTime<Utc>,
    events: Arc<EventLog>,
    artifacts: ArtifactStore,
    cancel: CancellationToken,
    phase_started: AtomicBool,
    announced: Mutex<HashSet<String>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl RunContext {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Phase this run executes
    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once `phase:start` has been emitted for this run
    pub fn phase_started(&self) -> bool {
        self.phase_started.load(Ordering::SeqCst)
    }

    /// Emit an event into the run's journal
    pub fn emit(&self, kind: EventKind) -> Result<Event> {
        self.events.emit_kind(kind)
    }

    /// Register an additional subscriber, detached when the run closes
    pub fn subscribe(&self, callback: EventCallback) {
        let subscription = self.events.subscribe(callback);
        lock(&self.subscriptions).push(subscription);
    }

    /// Write a text artifact and announce it
    pub async fn write_text(
        &self,
        artifact_type: &str,
        content: &str,
        options: ArtifactOptions,
    ) -> Result<ArtifactRecord> {
        let record = self.artifacts.write_text(artifact_type, content, options).await?;
        self.announce(&record)?;
        Ok(record)
    }

    /// Write a JSON artifact and announce it
    pub async fn write_json<T>(
        &self,
        artifact_type: &str,
        document: &T,
        options: ArtifactOptions,
    ) -> Result<ArtifactRecord>
    where
        T: Serialize + ?Sized + Sync,
    {
        let record = self.artifacts.write_json(artifact_type, document, options).await?;
        self.announce(&record)?;
        Ok(record)
    }

    /// Write a binary artifact and announce it
    pub async fn write_bytes(
        &self,
        artifact_type: &str,
        bytes: &[u8],
        options: ArtifactOptions,
    ) -> Result<ArtifactRecord> {
        let record = self.artifacts.write_bytes(artifact_type, bytes, options).await?;
        self.announce(&record)?;
        Ok(record)
    }

    /// Emit an `artifact` event for `record` unless this run already did.
    /// Returns whether an event was emitted.
    pub fn announce(&self, record: &ArtifactRecord) -> Result<bool> {
        if lock(&self.announced).contains(&record.uri) {
            return Ok(false);
        }
        self.emit(record.to_event())?;
        lock(&self.announced).insert(record.uri.clone());
        Ok(true)
    }

    fn start_phase(&self) -> Result<()> {
        if !self.phase_started() {
            self.emit(EventKind::phase_start(self.phase.as_str()))?;
            self.phase_started.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Detach every subscriber registered for this run. Idempotent.
    pub fn close(&self) {
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
    }
}

/// Outcome of a successful phase execution
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub phase: String,
    pub next_phase: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub summary: String,
    pub artifacts: Vec<ArtifactRecord>,
    pub events_path: PathBuf,
}

/// Runs one phase executor against a workflow's state
pub struct RunCoordinator {
    runs_root: PathBuf,
    state_store: StateStore,
    executor: Arc<dyn PhaseExecutor>,
}

impl RunCoordinator {
    pub fn new(
        runs_root: impl Into<PathBuf>,
        state_store: StateStore,
        executor: Arc<dyn PhaseExecutor>,
    ) -> Self {
        Self {
            runs_root: runs_root.into(),
            state_store,
            executor,
        }
    }

    pub fn phase(&self) -> &str {
        self.executor.phase()
    }

    pub fn executor(&self) -> &Arc<dyn PhaseExecutor> {
        &self.executor
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    /// Allocate a run: fresh id, artifact store, event log, and the given
    /// subscribers. Emits `phase:start` unless `emit_phase_start` is false.
    pub async fn create_run(
        &self,
        subscribers: Vec<EventCallback>,
        emit_phase_start: bool,
    ) -> Result<RunContext> {
        let run_id = RunId::generate();
        let artifacts = ArtifactStore::open(run_id.clone(), &self.runs_root).await?;
        let events = EventLog::open(run_id.clone(), &self.runs_root)?;

        let subscriptions = subscribers
            .into_iter()
            .map(|callback| events.subscribe(callback))
            .collect();

        let ctx = RunContext {
            run_id,
            phase: self.executor.phase().to_string(),
            created_at: Utc::now(),
            events,
            artifacts,
            cancel: CancellationToken::new(),
            phase_started: AtomicBool::new(false),
            announced: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(subscriptions),
        };
        info!(run_id = %ctx.run_id, phase = %ctx.phase, "Run created");

        if emit_phase_start {
            if let Err(err) = ctx.start_phase() {
                ctx.close();
                return Err(err);
            }
        }

        Ok(ctx)
    }

    /// Execute the phase, persist its effect on `state`, and close the run.
    ///
    /// Every path emits exactly one terminal `end` event (unless the journal
    /// itself is failing) and detaches the run's subscribers.
    #[instrument(skip(self, ctx, state, inputs), fields(run_id = %ctx.run_id(), phase = %ctx.phase()))]
    pub async fn execute(
        &self,
        ctx: &RunContext,
        state: &mut WorkflowState,
        inputs: &Inputs,
    ) -> Result<RunResult> {
        let clock = Instant::now();
        let started_at = Utc::now();

        let outcome = self.drive(ctx, state, inputs).await;
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => self.succeed(ctx, output, started_at, elapsed_ms),
            Err(err) if err.is_cancelled() => {
                warn!(elapsed_ms, "Run cancelled");
                emit_terminal(ctx, EndStatus::Cancelled, elapsed_ms);
                Err(err)
            }
            Err(err) => {
                error!(error = %err, elapsed_ms, "Run failed");
                if let Err(emit_err) =
                    ctx.emit(EventKind::error(ErrorSource::Runner, err.to_string(), false))
                {
                    error!(error = %emit_err, "Failed to record run error");
                }
                emit_terminal(ctx, EndStatus::Error, elapsed_ms);
                Err(err)
            }
        };

        ctx.close();
        result
    }

    async fn drive(
        &self,
        ctx: &RunContext,
        state: &mut WorkflowState,
        inputs: &Inputs,
    ) -> Result<PhaseOutput> {
        let phase = self.executor.phase();
        ctx.start_phase()?;

        ctx.cancellation().ensure_active()?;
        let output = self
            .executor
            .execute(ctx, inputs)
            .await
            .map_err(RunError::from_executor)?;
        ctx.cancellation().ensure_active()?;

        // Staged on a copy; the caller's document changes only once saved
        let mut staged = state.clone();
        if let Some(section) = output.state_section.as_deref() {
            staged.merge_section(section, output.state_fields.clone());
        }
        staged.complete_phase(phase, self.executor.next_phase(), Utc::now());
        self.state_store.save(&staged).await?;
        *state = staged;

        ctx.emit(EventKind::phase_end(phase))?;
        for record in &output.artifacts {
            ctx.announce(record)?;
        }

        Ok(output)
    }

    fn succeed(
        &self,
        ctx: &RunContext,
        output: PhaseOutput,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
    ) -> Result<RunResult> {
        let next_phase = self.executor.next_phase().map(str::to_string);
        let uris: Vec<&str> = output.artifacts.iter().map(|a| a.uri.as_str()).collect();

        ctx.emit(EventKind::End {
            status: EndStatus::Ok,
            elapsed_ms: Some(elapsed_ms),
            summary: Some(json!({
                "phase": ctx.phase(),
                "next_phase": next_phase,
                "summary": output.summary,
                "artifacts": uris,
            })),
        })?;
        info!(elapsed_ms, artifacts = output.artifacts.len(), "Run completed");

        Ok(RunResult {
            run_id: ctx.run_id().clone(),
            phase: ctx.phase().to_string(),
            next_phase,
            started_at,
            completed_at: Utc::now(),
            elapsed_ms,
            summary: output.summary,
            artifacts: output.artifacts,
            events_path: ctx.events().events_path().to_path_buf(),
        })
    }
}

fn emit_terminal(ctx: &RunContext, status: EndStatus, elapsed_ms: u64) {
    let end = EventKind::End {
        status,
        elapsed_ms: Some(elapsed_ms),
        summary: None,
    };
    if let Err(err) = ctx.emit(end) {
        error!(error = %err, status = status.as_str(), "Failed to record terminal event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state_store::WorkflowInit;
    use crate::domain::{PhaseStatus, Question};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct StubPhase {
        calls: AtomicUsize,
        fail: bool,
        cancel_during: bool,
        loose_artifact: bool,
    }

    impl StubPhase {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                cancel_during: false,
                loose_artifact: false,
            }
        }
    }

    #[async_trait]
    impl PhaseExecutor for StubPhase {
        fn phase(&self) -> &str {
            "discovery"
        }

        fn next_phase(&self) -> Option<&str> {
            Some("analyst")
        }

        fn questionnaire(&self, _project_name: Option<&str>) -> Vec<Question> {
            Vec::new()
        }

        fn preview(&self, _inputs: &Inputs, _project_name: Option<&str>) -> String {
            String::new()
        }

        async fn execute(&self, ctx: &RunContext, _inputs: &Inputs) -> anyhow::Result<PhaseOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("generation backend unavailable");
            }
            if self.cancel_during {
                ctx.cancellation().cancel();
            }

            let mut output = PhaseOutput::new("done");
            let record = if self.loose_artifact {
                ctx.artifacts()
                    .write_text("notes", "loose", ArtifactOptions::new().phase("discovery"))
                    .await?
            } else {
                ctx.write_text("notes", "announced", ArtifactOptions::new().phase("discovery"))
                    .await?
            };
            output.artifacts.push(record);

            let mut fields = serde_json::Map::new();
            fields.insert("discovery_completed".to_string(), json!(true));
            Ok(output.with_state("project_discovery", fields))
        }
    }

    struct Fixture {
        _temp: TempDir,
        coordinator: RunCoordinator,
        state: WorkflowState,
        executor: Arc<StubPhase>,
    }

    async fn fixture(executor: StubPhase) -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = StateStore::for_workflow(&temp.path().join("state"), "wf").unwrap();
        let state = store
            .initialize(&WorkflowInit {
                workflow_id: "wf".to_string(),
                workflow_type: "greenfield-discovery".to_string(),
                project_name: Some("Demo".to_string()),
                operation_mode: "interactive".to_string(),
                starting_phase: "discovery".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        let executor = Arc::new(executor);
        let coordinator = RunCoordinator::new(temp.path().join("runs"), store, executor.clone());
        Fixture {
            _temp: temp,
            coordinator,
            state,
            executor,
        }
    }

    fn collector() -> (EventCallback, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: EventCallback = Box::new(move |e: &Event| sink.lock().unwrap().push(e.clone()));
        (callback, seen)
    }

    fn labels(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .map(|e| match &e.kind {
                EventKind::Phase { status, .. } => match status {
                    PhaseStatus::Start => "phase:start".to_string(),
                    PhaseStatus::End => "phase:end".to_string(),
                },
                EventKind::End { status, .. } => format!("end:{}", status.as_str()),
                other => other.label().to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_run_envelope() {
        let mut f = fixture(StubPhase::new()).await;
        let (callback, seen) = collector();

        let ctx = f.coordinator.create_run(vec![callback], true).await.unwrap();
        let result = f
            .coordinator
            .execute(&ctx, &mut f.state, &Inputs::new())
            .await
            .unwrap();

        assert_eq!(
            labels(&seen.lock().unwrap()),
            vec!["phase:start", "artifact", "phase:end", "end:ok"]
        );
        assert_eq!(result.next_phase.as_deref(), Some("analyst"));
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(ctx.events().subscriber_count(), 0);

        let saved = f.coordinator.state_store().load().await.unwrap();
        assert_eq!(saved.completed_phases(), vec!["discovery".to_string()]);
        assert_eq!(saved.current_phase(), Some("analyst"));
        assert_eq!(saved.get("project_discovery").unwrap()["discovery_completed"], true);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_caller_state_untouched() {
        let mut f = fixture(StubPhase::new()).await;
        let before = f.state.clone();

        // A plain file where the workflow directory should be
        let state_dir = f.coordinator.state_store().path().parent().unwrap().to_path_buf();
        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, "not a directory").unwrap();

        let (callback, seen) = collector();
        let ctx = f.coordinator.create_run(vec![callback], true).await.unwrap();
        let err = f
            .coordinator
            .execute(&ctx, &mut f.state, &Inputs::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Persistence { .. }));
        assert_eq!(f.state, before);
        assert!(f.state.completed_phases().is_empty());
        assert_eq!(
            labels(&seen.lock().unwrap()),
            vec!["phase:start", "artifact", "error", "end:error"]
        );
    }

    #[tokio::test]
    async fn test_unannounced_artifacts_follow_phase_end() {
        let mut f = fixture(StubPhase {
            loose_artifact: true,
            ..StubPhase::new()
        })
        .await;

        let ctx = f.coordinator.create_run(Vec::new(), false).await.unwrap();
        f.coordinator
            .execute(&ctx, &mut f.state, &Inputs::new())
            .await
            .unwrap();

        let journal = ctx.events().replay().unwrap();
        assert_eq!(
            labels(&journal),
            vec!["phase:start", "phase:end", "artifact", "end:ok"]
        );
        let seqs: Vec<u64> = journal.iter().map(|e| e.seq.unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_executor_failure_emits_error_then_end() {
        let mut f = fixture(StubPhase {
            fail: true,
            ..StubPhase::new()
        })
        .await;
        let (callback, seen) = collector();

        let ctx = f.coordinator.create_run(vec![callback], true).await.unwrap();
        let err = f
            .coordinator
            .execute(&ctx, &mut f.state, &Inputs::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Executor(_)));
        let events = seen.lock().unwrap().clone();
        assert_eq!(labels(&events), vec!["phase:start", "error", "end:error"]);
        match &events[1].kind {
            EventKind::Error {
                source,
                message,
                retryable,
                ..
            } => {
                assert_eq!(*source, ErrorSource::Runner);
                assert!(message.contains("generation backend unavailable"));
                assert!(!retryable);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(ctx.events().subscriber_count(), 0);

        let saved = f.coordinator.state_store().load().await.unwrap();
        assert!(saved.completed_phases().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_executor() {
        let mut f = fixture(StubPhase::new()).await;
        let ctx = f.coordinator.create_run(Vec::new(), true).await.unwrap();
        ctx.cancellation().cancel();

        let err = f
            .coordinator
            .execute(&ctx, &mut f.state, &Inputs::new())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(f.executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            labels(&ctx.events().replay().unwrap()),
            vec!["phase:start", "end:cancelled"]
        );
    }

    #[tokio::test]
    async fn test_cancel_during_executor_observed_before_commit() {
        let mut f = fixture(StubPhase {
            cancel_during: true,
            ..StubPhase::new()
        })
        .await;
        let ctx = f.coordinator.create_run(Vec::new(), true).await.unwrap();

        let err = f
            .coordinator
            .execute(&ctx, &mut f.state, &Inputs::new())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(f.executor.calls.load(Ordering::SeqCst), 1);
        let journal = ctx.events().replay().unwrap();
        assert_eq!(labels(&journal), vec!["phase:start", "artifact", "end:cancelled"]);
        assert_eq!(journal.iter().filter(|e| e.is_terminal()).count(), 1);

        let saved = f.coordinator.state_store().load().await.unwrap();
        assert_eq!(saved.current_phase(), Some("discovery"));
    }
}
