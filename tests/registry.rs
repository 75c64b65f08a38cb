//! Job Registry Integration Tests
//!
//! Tests for input collection, streaming, cancellation, and workflow claims.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arcindex::core::{
    EventStream, FetchResult, JobOutcome, JobRegistry, JobStatus, RegistrySettings, RunContext,
    StartRequest, EVENTS_FILE,
};
use arcindex::domain::{
    ArtifactOptions, EndStatus, Event, EventKind, PhaseStatus, Question, RunId, RunStatus,
};
use arcindex::error::RunError;
use arcindex::phases::{Inputs, PhaseCatalog, PhaseExecutor, PhaseOutput};
use async_trait::async_trait;
use futures::StreamExt;
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    /// Block until the run's cancellation token fires, then return normally
    UntilCancelled,
}

struct IntakePhase {
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl IntakePhase {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PhaseExecutor for IntakePhase {
    fn phase(&self) -> &str {
        "intake"
    }

    fn questionnaire(&self, _project_name: Option<&str>) -> Vec<Question> {
        ["alpha", "beta", "gamma"]
            .iter()
            .enumerate()
            .map(|(i, key)| Question {
                number: i as u32 + 1,
                key: key.to_string(),
                prompt: format!("What is {}?", key),
            })
            .collect()
    }

    fn preview(&self, inputs: &Inputs, _project_name: Option<&str>) -> String {
        format!("{} answers", inputs.len())
    }

    async fn execute(&self, ctx: &RunContext, inputs: &Inputs) -> anyhow::Result<PhaseOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Fail => anyhow::bail!("intake backend unavailable"),
            Behaviour::UntilCancelled => ctx.cancellation().wait().await,
            Behaviour::Succeed => {}
        }

        let body = inputs
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n");
        let record = ctx
            .write_text("intake_notes", &body, ArtifactOptions::new().phase("intake"))
            .await?;
        Ok(PhaseOutput::new("intake complete").with_artifact(record))
    }
}

fn registry(temp: &TempDir, executor: Arc<IntakePhase>) -> Arc<JobRegistry> {
    let mut phases = PhaseCatalog::new();
    phases.register(executor);
    let settings = RegistrySettings::new(temp.path().join("runs"), temp.path().join("state"));
    Arc::new(JobRegistry::new(settings, phases))
}

fn request(answers: &[(&str, &str)]) -> StartRequest {
    StartRequest {
        phase: Some("intake".to_string()),
        answers: answers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

fn answers(pairs: &[(&str, &str)]) -> Inputs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn collect(mut stream: EventStream) -> Vec<Event> {
    tokio::time::timeout(Duration::from_secs(5), async move {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("stream did not terminate")
}

fn lifecycle(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Phase { status, .. } => Some(match status {
                PhaseStatus::Start => "phase:start".to_string(),
                PhaseStatus::End => "phase:end".to_string(),
            }),
            EventKind::Artifact { .. } => Some("artifact".to_string()),
            EventKind::End { status, .. } => Some(format!("end:{}", status.as_str())),
            _ => None,
        })
        .collect()
}

fn journal(temp: &TempDir, run_id: &RunId) -> Vec<Event> {
    let path = temp
        .path()
        .join("runs")
        .join(run_id.as_str())
        .join("logs")
        .join(EVENTS_FILE);
    arcindex::core::replay_file(&path).unwrap()
}

#[tokio::test]
async fn test_pending_job_prompts_then_runs_after_answers() {
    let temp = TempDir::new().unwrap();
    let executor = IntakePhase::new(Behaviour::Succeed);
    let registry = registry(&temp, executor.clone());

    let (handle, status) = registry
        .start(request(&[("alpha", "a"), ("beta", "b")]))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Pending);
    assert_eq!(handle.expected_keys, vec!["alpha", "beta", "gamma"]);
    assert_eq!(
        registry.status(&handle.run_id).await,
        Some(RunStatus::PendingInputs)
    );

    let mut stream = registry.subscribe_stream(&handle.run_id).await.unwrap();
    match stream.next().await.unwrap().kind {
        EventKind::Prompt { missing, questions } => {
            assert_eq!(missing, vec!["gamma".to_string()]);
            assert_eq!(questions.len(), 3);
        }
        other => panic!("expected prompt, got {:?}", other),
    }

    let status = registry
        .submit_answers(&handle.run_id, answers(&[("gamma", "c")]), None)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Started);

    let events = collect(stream).await;
    assert_eq!(
        lifecycle(&events),
        vec!["phase:start", "artifact", "phase:end", "end:ok"]
    );
    assert!(events.last().unwrap().is_terminal());
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::Answers { missing, .. } if missing.is_empty()
    )));

    match registry.wait(&handle.run_id).await.unwrap() {
        JobOutcome::Succeeded(result) => {
            assert_eq!(result.summary, "intake complete");
            assert_eq!(result.artifacts.len(), 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    // Journal sequence numbers are exactly 0..N-1
    let journal = journal(&temp, &handle.run_id);
    let seqs: Vec<u64> = journal.iter().map(|e| e.seq.unwrap()).collect();
    assert_eq!(seqs, (0..journal.len() as u64).collect::<Vec<_>>());
    assert_eq!(journal.len(), events.len() + 1);
}

#[tokio::test]
async fn test_independent_subscribers_see_identical_sequences() {
    let temp = TempDir::new().unwrap();
    let registry = registry(&temp, IntakePhase::new(Behaviour::Succeed));

    let (handle, _) = registry.start(request(&[("alpha", "a")])).await.unwrap();
    let early = registry.subscribe_stream(&handle.run_id).await.unwrap();
    let early = tokio::spawn(collect(early));

    registry
        .submit_answers(&handle.run_id, answers(&[("beta", "b"), ("gamma", "c")]), None)
        .await
        .unwrap();
    registry.wait(&handle.run_id).await.unwrap();

    // Attached after completion: replays the backlog
    let late = collect(registry.subscribe_stream(&handle.run_id).await.unwrap()).await;
    let early = early.await.unwrap();

    assert_eq!(early, late);
    assert!(early.last().unwrap().is_terminal());
    assert_eq!(early.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_cancel_pending_job_never_runs_executor() {
    let temp = TempDir::new().unwrap();
    let executor = IntakePhase::new(Behaviour::Succeed);
    let registry = registry(&temp, executor.clone());

    let (handle, _) = registry.start(request(&[])).await.unwrap();
    let stream = registry.subscribe_stream(&handle.run_id).await.unwrap();

    assert_eq!(registry.cancel(&handle.run_id).await, JobStatus::Cancelled);

    let events = collect(stream).await;
    assert_eq!(lifecycle(&events), vec!["end:cancelled"]);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

    assert_eq!(registry.status(&handle.run_id).await, None);
    assert_eq!(registry.cancel(&handle.run_id).await, JobStatus::NotFound);
    assert_eq!(
        registry
            .submit_answers(&handle.run_id, answers(&[("alpha", "a")]), None)
            .await
            .unwrap(),
        JobStatus::NotFound
    );
    assert!(registry.subscribe_stream(&handle.run_id).await.is_none());
}

#[tokio::test]
async fn test_cancel_running_job_yields_single_terminal_event() {
    let temp = TempDir::new().unwrap();
    let executor = IntakePhase::new(Behaviour::UntilCancelled);
    let registry = registry(&temp, executor.clone());

    let (handle, status) = registry
        .start(request(&[("alpha", "a"), ("beta", "b"), ("gamma", "c")]))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Started);
    let stream = registry.subscribe_stream(&handle.run_id).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while executor.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(registry.status(&handle.run_id).await, Some(RunStatus::Running));

    assert_eq!(registry.cancel(&handle.run_id).await, JobStatus::Cancelling);

    let events = collect(stream).await;
    let terminals: Vec<&Event> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    assert!(matches!(
        terminals[0].kind,
        EventKind::End {
            status: EndStatus::Cancelled,
            ..
        }
    ));
    assert_eq!(registry.run_ids().await, Vec::<RunId>::new());
}

#[tokio::test]
async fn test_failed_run_reports_error_then_end() {
    let temp = TempDir::new().unwrap();
    let registry = registry(&temp, IntakePhase::new(Behaviour::Fail));

    let (handle, _) = registry
        .start(request(&[("alpha", "a"), ("beta", "b"), ("gamma", "c")]))
        .await
        .unwrap();
    let events = collect(registry.subscribe_stream(&handle.run_id).await.unwrap()).await;

    let tail: Vec<&str> = events.iter().rev().take(2).map(|e| e.label()).collect();
    assert_eq!(tail, vec!["end", "error"]);
    assert_eq!(lifecycle(&events), vec!["phase:start", "end:error"]);

    match registry.fetch_result(&handle.run_id).await {
        FetchResult::Ready(JobOutcome::Failed(message)) => {
            assert!(message.contains("intake backend unavailable"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(matches!(
        registry.fetch_result(&handle.run_id).await,
        FetchResult::NotFound
    ));
}

#[tokio::test]
async fn test_submit_after_completion_reports_completed() {
    let temp = TempDir::new().unwrap();
    let registry = registry(&temp, IntakePhase::new(Behaviour::Succeed));

    let (handle, _) = registry
        .start(request(&[("alpha", "a"), ("beta", "b"), ("gamma", "c")]))
        .await
        .unwrap();
    registry.wait(&handle.run_id).await.unwrap();

    let status = registry
        .submit_answers(&handle.run_id, answers(&[("alpha", "again")]), None)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(registry.cancel(&handle.run_id).await, JobStatus::Completed);
    assert_eq!(registry.status(&handle.run_id).await, None);
}

#[tokio::test]
async fn test_second_start_on_active_workflow_fails_fast() {
    let temp = TempDir::new().unwrap();
    let registry = registry(&temp, IntakePhase::new(Behaviour::Succeed));
    let on_workflow = || StartRequest {
        workflow_id: Some("wf-shared".to_string()),
        ..request(&[])
    };

    let (first, status) = registry.start(on_workflow()).await.unwrap();
    assert_eq!(status, JobStatus::Pending);
    assert_eq!(first.workflow_id, "wf-shared");

    match registry.start(on_workflow()).await {
        Err(RunError::AlreadyActive(workflow)) => assert_eq!(workflow, "wf-shared"),
        other => panic!("expected AlreadyActive, got {:?}", other.map(|(h, s)| (h.run_id, s))),
    }

    registry.cancel(&first.run_id).await;
    let (second, _) = registry.start(on_workflow()).await.unwrap();
    assert_ne!(second.run_id, first.run_id);
}

#[tokio::test]
async fn test_workflow_id_cannot_escape_state_root() {
    let temp = TempDir::new().unwrap();
    let registry = registry(&temp, IntakePhase::new(Behaviour::Succeed));

    for bad in ["../outside", "nested/wf", ".."] {
        let result = registry
            .start(StartRequest {
                workflow_id: Some(bad.to_string()),
                ..request(&[])
            })
            .await;
        assert!(
            matches!(&result, Err(RunError::InvalidWorkflowId(id)) if id == bad),
            "accepted {:?}",
            bad
        );
    }

    assert!(!temp.path().join("outside").exists());
    assert!(registry.run_ids().await.is_empty());
}

#[tokio::test]
async fn test_event_stream_adapts_to_futures_stream() {
    let temp = TempDir::new().unwrap();
    let registry = registry(&temp, IntakePhase::new(Behaviour::Succeed));

    let (handle, _) = registry
        .start(request(&[("alpha", "a"), ("beta", "b"), ("gamma", "c")]))
        .await
        .unwrap();
    let stream = registry.subscribe_stream(&handle.run_id).await.unwrap();

    let events: Vec<Event> = tokio::time::timeout(
        Duration::from_secs(5),
        stream.into_stream().collect::<Vec<_>>(),
    )
    .await
    .unwrap();

    assert_eq!(
        lifecycle(&events),
        vec!["phase:start", "artifact", "phase:end", "end:ok"]
    );
    let direct = collect(registry.subscribe_stream(&handle.run_id).await.unwrap()).await;
    assert_eq!(events, direct);
}

#[tokio::test]
async fn test_invalid_elicitation_choice_is_rejected() {
    let temp = TempDir::new().unwrap();
    let registry = registry(&temp, IntakePhase::new(Behaviour::Succeed));

    let result = registry
        .start(StartRequest {
            elicitation_choice: 12,
            ..request(&[])
        })
        .await;
    assert!(matches!(result, Err(RunError::InvalidElicitation(12))));

    let (handle, _) = registry.start(request(&[])).await.unwrap();
    let result = registry
        .submit_answers(&handle.run_id, Inputs::new(), Some(0))
        .await;
    assert!(matches!(result, Err(RunError::InvalidElicitation(0))));
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let temp = TempDir::new().unwrap();
    let registry = registry(&temp, IntakePhase::new(Behaviour::Succeed));
    let missing = RunId::generate();

    assert_eq!(registry.cancel(&missing).await, JobStatus::NotFound);
    assert!(registry.subscribe_stream(&missing).await.is_none());
    assert!(registry.wait(&missing).await.is_none());
    assert!(matches!(
        registry.fetch_result(&missing).await,
        FetchResult::NotFound
    ));
}
