//! Job registry: many concurrent runs, each independently streamed,
//! fed with answers, and cancellable.
//!
//! A job is parked in `pending` until every expected answer is present, then
//! launched on its own tokio task. Every event a job emits is recorded in a
//! per-job feed; each `subscribe_stream` caller gets the backlog plus its own
//! unbounded queue for live events, so a slow reader never blocks the run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ResolvedConfig, DEFAULT_OPERATION_MODE, DEFAULT_WORKFLOW};
use crate::domain::{EndStatus, Event, EventKind, Question, RunId, RunStatus};
use crate::error::{Result, RunError};
use crate::phases::{ElicitationMenu, Inputs, PhaseCatalog};

use super::cancellation::CancellationToken;
use super::coordinator::{RunContext, RunCoordinator, RunResult};
use super::event_log::{EventCallback, EventLog};
use super::lock;
use super::state_store::{StateStore, WorkflowInit, WorkflowState};

/// Where the registry keeps runs and workflow state, and the defaults for
/// new workflows
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub runs_root: PathBuf,
    pub state_root: PathBuf,
    pub workflow_template: Option<PathBuf>,
    pub default_workflow: String,
    pub operation_mode: String,
}

impl RegistrySettings {
    pub fn new(runs_root: impl Into<PathBuf>, state_root: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: runs_root.into(),
            state_root: state_root.into(),
            workflow_template: None,
            default_workflow: DEFAULT_WORKFLOW.to_string(),
            operation_mode: DEFAULT_OPERATION_MODE.to_string(),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            runs_root: config.runs_root.clone(),
            state_root: config.state_root.clone(),
            workflow_template: config.workflow_template.clone(),
            default_workflow: config.default_workflow.clone(),
            operation_mode: config.operation_mode.clone(),
        }
    }
}

/// Parameters for [`JobRegistry::start`]
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub project_name: Option<String>,
    pub answers: Inputs,
    /// Phase to run; defaults to the workflow's current phase
    pub phase: Option<String>,
    /// Existing workflow to continue; a new one is created when absent
    pub workflow_id: Option<String>,
    pub workflow_type: Option<String>,
    pub operation_mode: Option<String>,
    /// Elicitation menu selection (1 proceeds without refinement)
    pub elicitation_choice: u32,
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            project_name: None,
            answers: Inputs::new(),
            phase: None,
            workflow_id: None,
            workflow_type: None,
            operation_mode: None,
            elicitation_choice: 1,
        }
    }
}

/// Status string returned by registry control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Started,
    Cancelled,
    Cancelling,
    Completed,
    NotFound,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Started => "started",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Completed => "completed",
            JobStatus::NotFound => "not_found",
        }
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(RunResult),
    Cancelled,
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            JobOutcome::Succeeded(_) => RunStatus::Completed,
            JobOutcome::Cancelled => RunStatus::Cancelled,
            JobOutcome::Failed(_) => RunStatus::Errored,
        }
    }
}

/// Answer to [`JobRegistry::fetch_result`]
#[derive(Debug, Clone)]
pub enum FetchResult {
    NotFound,
    /// Not terminal yet; the job stays registered
    Pending(RunStatus),
    /// Terminal; the job has been removed
    Ready(JobOutcome),
}

/// What a caller learns about a job it just started
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub run_id: RunId,
    pub workflow_id: String,
    pub phase: String,
    pub expected_keys: Vec<String>,
    pub questions: Vec<Question>,
}

/// Render an event as a server-sent-events frame
pub fn sse_frame(event: &Event) -> String {
    event.to_sse_frame()
}

#[derive(Default)]
struct Feed {
    history: Vec<Event>,
    senders: Vec<mpsc::UnboundedSender<Event>>,
    closed: bool,
}

impl Feed {
    fn push(&mut self, event: &Event) {
        if self.closed {
            return;
        }
        self.history.push(event.clone());
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
        if event.is_terminal() {
            self.close();
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.senders.clear();
    }
}

fn feed_callback(feed: Arc<Mutex<Feed>>) -> EventCallback {
    Box::new(move |event: &Event| lock(&feed).push(event))
}

/// A per-caller view of a run's events: everything emitted so far, then live
/// events, ending after the terminal `end` event
pub struct EventStream {
    backlog: VecDeque<Event>,
    receiver: Option<mpsc::UnboundedReceiver<Event>>,
    finished: bool,
}

impl EventStream {
    /// Next event, or `None` once the terminal event has been yielded
    pub async fn next(&mut self) -> Option<Event> {
        if self.finished {
            return None;
        }

        let event = match self.backlog.pop_front() {
            Some(event) => Some(event),
            None => match self.receiver.as_mut() {
                Some(receiver) => receiver.recv().await,
                None => None,
            },
        };

        match event {
            Some(event) => {
                if event.is_terminal() {
                    self.finish();
                }
                Some(event)
            }
            None => {
                self.finish();
                None
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.backlog.clear();
        self.receiver = None;
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> {
        stream::unfold(self, |mut events| async move {
            events.next().await.map(|event| (event, events))
        })
    }
}

#[derive(Clone, Default)]
struct WorkflowClaims(Arc<Mutex<HashSet<String>>>);

impl WorkflowClaims {
    fn claim(&self, workflow_id: &str) -> Result<WorkflowClaim> {
        if !lock(&self.0).insert(workflow_id.to_string()) {
            return Err(RunError::AlreadyActive(workflow_id.to_string()));
        }
        Ok(WorkflowClaim {
            workflow_id: workflow_id.to_string(),
            claims: self.clone(),
        })
    }
}

/// Exclusive right to mutate one workflow's state; released on drop
struct WorkflowClaim {
    workflow_id: String,
    claims: WorkflowClaims,
}

impl Drop for WorkflowClaim {
    fn drop(&mut self) {
        lock(&self.claims.0).remove(&self.workflow_id);
    }
}

/// Everything the background task takes ownership of at launch
struct Launch {
    context: RunContext,
    state: WorkflowState,
    claim: WorkflowClaim,
}

struct PendingRun {
    answers: Inputs,
    project_name: Option<String>,
    elicitation_choice: u32,
    launch: Option<Launch>,
    task: Option<JoinHandle<()>>,
}

struct Job {
    run_id: RunId,
    workflow_id: String,
    phase: String,
    coordinator: Arc<RunCoordinator>,
    expected_keys: Vec<String>,
    questions: Vec<Question>,
    events: Arc<EventLog>,
    cancel: CancellationToken,
    feed: Arc<Mutex<Feed>>,
    outcome: watch::Sender<Option<JobOutcome>>,
    inner: tokio::sync::Mutex<PendingRun>,
}

impl Job {
    fn missing(&self, answers: &Inputs) -> Vec<String> {
        self.expected_keys
            .iter()
            .filter(|key| !answers.contains_key(key.as_str()))
            .cloned()
            .collect()
    }

    fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    /// Record the terminal outcome (first writer wins) and end every stream
    fn finish(&self, outcome: JobOutcome) {
        self.outcome.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        });
        lock(&self.feed).close();
    }

    async fn wait_outcome(&self) -> JobOutcome {
        let mut receiver = self.outcome.subscribe();
        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| JobOutcome::Failed("run outcome unavailable".to_string()))
    }
}

/// Marks the job failed if its task ends without recording an outcome
struct OutcomeGuard(Arc<Job>);

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        self.0.finish(JobOutcome::Failed("run task aborted".to_string()));
    }
}

/// Concurrency hub for active jobs
pub struct JobRegistry {
    settings: RegistrySettings,
    phases: PhaseCatalog,
    jobs: tokio::sync::Mutex<HashMap<RunId, Arc<Job>>>,
    claims: WorkflowClaims,
}

impl JobRegistry {
    pub fn new(settings: RegistrySettings, phases: PhaseCatalog) -> Self {
        Self {
            settings,
            phases,
            jobs: tokio::sync::Mutex::new(HashMap::new()),
            claims: WorkflowClaims::default(),
        }
    }

    /// Registry with the built-in phases
    pub fn with_builtin(settings: RegistrySettings) -> Self {
        Self::new(settings, PhaseCatalog::with_builtin())
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Create a job and launch it if the initial answers are complete.
    ///
    /// Fails with [`RunError::AlreadyActive`] while another job holds the
    /// same workflow.
    pub async fn start(&self, request: StartRequest) -> Result<(JobHandle, JobStatus)> {
        let menu = ElicitationMenu::new();
        menu.option(request.elicitation_choice)?;

        let workflow_id = request.workflow_id.clone().unwrap_or_else(generate_workflow_id);
        let mut store = StateStore::for_workflow(&self.settings.state_root, &workflow_id)?;
        let claim = self.claims.claim(&workflow_id)?;

        if let Some(template) = &self.settings.workflow_template {
            store = store.with_template_file(template).await?;
        }

        let state = if store.exists() {
            store.load().await?
        } else {
            store
                .initialize(&WorkflowInit {
                    workflow_id: workflow_id.clone(),
                    workflow_type: request
                        .workflow_type
                        .clone()
                        .unwrap_or_else(|| self.settings.default_workflow.clone()),
                    project_name: request.project_name.clone(),
                    operation_mode: request
                        .operation_mode
                        .clone()
                        .unwrap_or_else(|| self.settings.operation_mode.clone()),
                    starting_phase: request
                        .phase
                        .clone()
                        .unwrap_or_else(|| PhaseCatalog::DEFAULT_PHASE.to_string()),
                    timestamp: Utc::now(),
                })
                .await?
        };

        let phase = request
            .phase
            .clone()
            .or_else(|| state.current_phase().map(str::to_string))
            .unwrap_or_else(|| PhaseCatalog::DEFAULT_PHASE.to_string());
        let executor = self.phases.get(&phase)?;

        let questions = executor.questionnaire(request.project_name.as_deref());
        let expected_keys: Vec<String> = questions.iter().map(|q| q.key.clone()).collect();

        let mut answers = request.answers;
        if let Some(name) = request.project_name.as_ref().filter(|n| !n.is_empty()) {
            answers
                .entry("project_name".to_string())
                .or_insert_with(|| name.clone());
        }

        let coordinator = Arc::new(RunCoordinator::new(
            self.settings.runs_root.clone(),
            store,
            executor,
        ));
        let feed = Arc::new(Mutex::new(Feed::default()));
        let context = coordinator
            .create_run(vec![feed_callback(Arc::clone(&feed))], false)
            .await?;

        let run_id = context.run_id().clone();
        let job = Arc::new(Job {
            run_id: run_id.clone(),
            workflow_id: workflow_id.clone(),
            phase: phase.clone(),
            coordinator,
            expected_keys: expected_keys.clone(),
            questions: questions.clone(),
            events: Arc::clone(context.events()),
            cancel: context.cancellation().clone(),
            feed,
            outcome: watch::channel(None).0,
            inner: tokio::sync::Mutex::new(PendingRun {
                answers,
                project_name: request.project_name,
                elicitation_choice: request.elicitation_choice,
                launch: Some(Launch {
                    context,
                    state,
                    claim,
                }),
                task: None,
            }),
        });

        self.jobs.lock().await.insert(run_id.clone(), Arc::clone(&job));
        info!(%run_id, workflow_id = %workflow_id, phase = %phase, "Job created");

        let status = {
            let mut pending = job.inner.lock().await;
            self.launch_if_ready(&job, &mut pending)
        };
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                self.jobs.lock().await.remove(&run_id);
                return Err(err);
            }
        };

        Ok((
            JobHandle {
                run_id,
                workflow_id,
                phase,
                expected_keys,
                questions,
            },
            status,
        ))
    }

    /// Merge answers into a job and launch it once complete
    pub async fn submit_answers(
        &self,
        run_id: &RunId,
        answers: Inputs,
        elicitation_choice: Option<u32>,
    ) -> Result<JobStatus> {
        let Some(job) = self.get(run_id).await else {
            return Ok(JobStatus::NotFound);
        };
        if job.outcome().is_some() {
            return Ok(JobStatus::Completed);
        }
        if let Some(choice) = elicitation_choice {
            ElicitationMenu::new().option(choice)?;
        }

        let mut pending = job.inner.lock().await;
        // A cancel queued ahead of us may have finished the job meanwhile
        if job.outcome().is_some() || (pending.launch.is_none() && pending.task.is_none()) {
            return Ok(JobStatus::Completed);
        }
        if pending.task.is_some() {
            return Ok(JobStatus::Started);
        }
        if let Some(choice) = elicitation_choice {
            pending.elicitation_choice = choice;
        }
        pending.answers.extend(answers);
        debug!(%run_id, answers = pending.answers.len(), "Answers submitted");

        job.events.emit_kind(EventKind::Answers {
            answers: pending.answers.clone(),
            missing: job.missing(&pending.answers),
        })?;

        self.launch_if_ready(&job, &mut pending)
    }

    fn launch_if_ready(&self, job: &Arc<Job>, pending: &mut PendingRun) -> Result<JobStatus> {
        if pending.task.is_some() {
            return Ok(JobStatus::Started);
        }
        if job.outcome().is_some() || pending.launch.is_none() {
            return Ok(JobStatus::Completed);
        }

        let missing = job.missing(&pending.answers);
        if !missing.is_empty() {
            job.events.emit_kind(EventKind::Prompt {
                questions: job.questions.clone(),
                missing,
            })?;
            return Ok(JobStatus::Pending);
        }

        let elicitation = if pending.elicitation_choice == 1 {
            None
        } else {
            Some(ElicitationMenu::new().option(pending.elicitation_choice)?.clone())
        };
        let Some(launch) = pending.launch.as_mut() else {
            return Ok(JobStatus::Completed);
        };

        job.events.emit_kind(EventKind::Answers {
            answers: pending.answers.clone(),
            missing: Vec::new(),
        })?;

        let preview = job
            .coordinator
            .executor()
            .preview(&pending.answers, pending.project_name.as_deref());
        job.events.emit_kind(EventKind::Summary {
            summary: preview.clone(),
        })?;

        if let Some(option) = elicitation {
            launch
                .state
                .record_elicitation(&job.phase, option.number, &option.label, Utc::now());
            job.events.emit_kind(EventKind::Elicitation {
                method: option.label,
                description: Some(option.description),
                summary: Some(preview),
            })?;
        }

        let Some(launch) = pending.launch.take() else {
            return Ok(JobStatus::Completed);
        };
        let answers = pending.answers.clone();
        let guard = OutcomeGuard(Arc::clone(job));

        pending.task = Some(tokio::spawn(async move {
            let job = Arc::clone(&guard.0);
            let Launch {
                context,
                mut state,
                claim,
            } = launch;

            let result = job.coordinator.execute(&context, &mut state, &answers).await;
            drop(claim);

            let outcome = match result {
                Ok(result) => JobOutcome::Succeeded(result),
                Err(err) if err.is_cancelled() => JobOutcome::Cancelled,
                Err(err) => JobOutcome::Failed(err.to_string()),
            };
            info!(run_id = %job.run_id, status = outcome.status().as_str(), "Job finished");
            job.finish(outcome);
            drop(guard);
        }));

        info!(run_id = %job.run_id, workflow_id = %job.workflow_id, "Job launched");
        Ok(JobStatus::Started)
    }

    /// Independent event stream for a run, or `None` if the run is unknown
    pub async fn subscribe_stream(&self, run_id: &RunId) -> Option<EventStream> {
        let job = self.get(run_id).await?;
        let mut feed = lock(&job.feed);

        let backlog = feed.history.iter().cloned().collect();
        let receiver = if feed.closed {
            None
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            feed.senders.push(tx);
            Some(rx)
        };

        Some(EventStream {
            backlog,
            receiver,
            finished: false,
        })
    }

    /// Cancel a job.
    ///
    /// A pending job ends immediately without its executor ever running. A
    /// running job is signalled and awaited; cancellation is observed at the
    /// coordinator's next checkpoint, so the run may still finish normally.
    pub async fn cancel(&self, run_id: &RunId) -> JobStatus {
        let Some(job) = self.get(run_id).await else {
            return JobStatus::NotFound;
        };
        if job.outcome().is_some() {
            self.remove(run_id).await;
            return JobStatus::Completed;
        }

        let mut pending = job.inner.lock().await;
        if job.outcome().is_some() {
            drop(pending);
            self.remove(run_id).await;
            return JobStatus::Completed;
        }
        if pending.task.is_none() {
            if let Err(err) = job.events.emit_kind(EventKind::end(EndStatus::Cancelled)) {
                warn!(%run_id, error = %err, "Failed to record cancellation");
            }
            if let Some(launch) = pending.launch.take() {
                launch.context.close();
            }
            job.finish(JobOutcome::Cancelled);
            drop(pending);

            self.remove(run_id).await;
            info!(%run_id, "Pending job cancelled");
            return JobStatus::Cancelled;
        }
        drop(pending);

        if job.outcome().is_some() {
            self.remove(run_id).await;
            return JobStatus::Completed;
        }

        info!(%run_id, "Cancelling running job");
        job.cancel.cancel();
        let outcome = job.wait_outcome().await;
        debug!(%run_id, status = outcome.status().as_str(), "Cancelled job settled");

        self.remove(run_id).await;
        JobStatus::Cancelling
    }

    /// Current status of a registered job
    pub async fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        let job = self.get(run_id).await?;
        if let Some(outcome) = job.outcome() {
            return Some(outcome.status());
        }
        let pending = job.inner.lock().await;
        Some(if pending.task.is_some() {
            RunStatus::Running
        } else {
            RunStatus::PendingInputs
        })
    }

    /// Collect a terminal job's outcome, removing it from the registry
    pub async fn fetch_result(&self, run_id: &RunId) -> FetchResult {
        let Some(job) = self.get(run_id).await else {
            return FetchResult::NotFound;
        };
        match job.outcome() {
            Some(outcome) => {
                self.remove(run_id).await;
                FetchResult::Ready(outcome)
            }
            None => match self.status(run_id).await {
                Some(status) => FetchResult::Pending(status),
                None => FetchResult::NotFound,
            },
        }
    }

    /// Wait for a job's outcome without removing it
    pub async fn wait(&self, run_id: &RunId) -> Option<JobOutcome> {
        let job = self.get(run_id).await?;
        Some(job.wait_outcome().await)
    }

    /// Identifiers of every registered job, sorted
    pub async fn run_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn get(&self, run_id: &RunId) -> Option<Arc<Job>> {
        self.jobs.lock().await.get(run_id).cloned()
    }

    async fn remove(&self, run_id: &RunId) {
        self.jobs.lock().await.remove(run_id);
    }
}

/// `arcindex-<yyyymmddhhmmss>-<8 hex>`
fn generate_workflow_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("arcindex-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), &suffix[..8])
}
