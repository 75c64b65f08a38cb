//! Command-line interface for arcindex.
//!
//! Provides commands for running a workflow phase, inspecting runs from
//! their journals, and showing workflow state and configuration.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use crate::config;
use crate::core::{
    replay_file, FetchResult, JobOutcome, JobRegistry, JobStatus, RegistrySettings, StartRequest,
    StateStore, EVENTS_FILE,
};
use crate::domain::{Event, EventKind, PhaseStatus, RunId, RunSummary};
use crate::phases::{discovery, ElicitationMenu, Inputs};

/// arcindex - Run-lifecycle coordinator for streamed workflow phases
#[derive(Parser, Debug)]
#[command(name = "arcindex")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a workflow phase, prompting for missing answers
    Run {
        /// Project name (skips the project name question)
        #[arg(short, long)]
        project: Option<String>,

        /// File with numbered answers ("1. ...", "2) ...") or a JSON object
        #[arg(short, long)]
        answers_file: Option<PathBuf>,

        /// Individual answer as key=value (repeatable)
        #[arg(long = "answer", value_name = "KEY=VALUE")]
        answers: Vec<String>,

        /// Phase to run (defaults to the workflow's current phase)
        #[arg(long)]
        phase: Option<String>,

        /// Continue an existing workflow
        #[arg(short, long)]
        workflow: Option<String>,

        /// Elicitation menu selection (1-9)
        #[arg(short, long, default_value = "1")]
        elicitation: u32,

        /// Print events as server-sent-event frames
        #[arg(long)]
        sse: bool,
    },

    /// Show the status of a run, reconstructed from its journal
    Status {
        /// Run ID (32 hex characters)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print a run's journal
    Events {
        /// Run ID (32 hex characters)
        run_id: String,

        /// Print as server-sent-event frames instead of NDJSON
        #[arg(long)]
        sse: bool,
    },

    /// Show a workflow's state document
    State {
        /// Workflow ID
        workflow_id: String,
    },

    /// Show the discovery questions and elicitation menu
    Questions {
        /// Project name
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                project,
                answers_file,
                answers,
                phase,
                workflow,
                elicitation,
                sse,
            } => {
                let mut inputs = match answers_file {
                    Some(path) => read_answers_file(&path)?,
                    None => Inputs::new(),
                };
                inputs.extend(parse_answer_pairs(&answers)?);

                let request = StartRequest {
                    project_name: project,
                    answers: inputs,
                    phase,
                    workflow_id: workflow,
                    elicitation_choice: elicitation,
                    ..Default::default()
                };
                run_phase(request, sse).await
            }
            Commands::Status { run_id } => show_status(&run_id),
            Commands::Runs { limit } => list_runs(limit),
            Commands::Events { run_id, sse } => show_events(&run_id, sse),
            Commands::State { workflow_id } => show_state(&workflow_id).await,
            Commands::Questions { project } => {
                println!("{}", discovery::format_questions(project.as_deref()));
                println!();
                println!("{}", ElicitationMenu::new().format());
                Ok(())
            }
            Commands::Config => show_config(),
        }
    }
}

/// Start a job, collect missing answers, and follow its stream to the end
async fn run_phase(request: StartRequest, sse: bool) -> Result<()> {
    let cfg = config::config()?;
    let registry = JobRegistry::with_builtin(RegistrySettings::from_config(cfg));

    let (handle, mut status) = registry.start(request).await?;
    let run_id = handle.run_id.clone();
    eprintln!(
        "[Run {} for workflow {} ({}): {}]",
        run_id,
        handle.workflow_id,
        handle.phase,
        status.as_str()
    );

    let mut stream = registry
        .subscribe_stream(&run_id)
        .await
        .context("Run disappeared before it could be followed")?;

    let interactive = io::stdin().is_terminal();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    while status == JobStatus::Pending {
        let Some(answers) = prompt_missing(&mut stream, &mut input, interactive).await? else {
            registry.cancel(&run_id).await;
            anyhow::bail!("Input ended before every question was answered");
        };
        status = registry.submit_answers(&run_id, answers, None).await?;
    }

    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                print_event(&event, sse);
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n[Cancelling run {}...]", run_id);
                let status = registry.cancel(&run_id).await;
                eprintln!("[Run {}: {}]", run_id, status.as_str());
                break;
            }
        }
    }

    match registry.fetch_result(&run_id).await {
        FetchResult::Ready(JobOutcome::Succeeded(result)) => {
            for artifact in &result.artifacts {
                eprintln!("  artifact: {}", artifact.uri);
            }
            eprintln!(
                "\n[Run {} completed in {}ms; next phase: {}]",
                run_id,
                result.elapsed_ms,
                result.next_phase.as_deref().unwrap_or("none")
            );
        }
        FetchResult::Ready(JobOutcome::Cancelled) => {
            eprintln!("\n[Run {} cancelled]", run_id);
        }
        FetchResult::Ready(JobOutcome::Failed(error)) => {
            eprintln!("\n[Run {} failed: {}]", run_id, error);
            std::process::exit(1);
        }
        FetchResult::Pending(status) => {
            eprintln!("\n[Run {} in state: {}]", run_id, status.as_str());
        }
        FetchResult::NotFound => {}
    }

    Ok(())
}

/// Read events up to the next prompt and ask for each missing answer.
///
/// Returns `None` when stdin is exhausted first.
async fn prompt_missing<R>(
    stream: &mut crate::core::EventStream,
    input: &mut Lines<R>,
    interactive: bool,
) -> Result<Option<Inputs>>
where
    R: AsyncBufRead + Unpin,
{
    let (questions, missing) = loop {
        match stream.next().await {
            Some(Event {
                kind: EventKind::Prompt { questions, missing },
                ..
            }) => break (questions, missing),
            Some(_) => continue,
            None => anyhow::bail!("Run ended while waiting for answers"),
        }
    };

    let mut answers = Inputs::new();
    for question in questions.iter().filter(|q| missing.contains(&q.key)) {
        if interactive {
            eprint!("{}. {}\n> ", question.number, question.prompt);
            io::stderr().flush().ok();
        }
        let Some(line) = input
            .next_line()
            .await
            .context("Failed to read from stdin")?
        else {
            return Ok(None);
        };
        answers.insert(question.key.clone(), line.trim().to_string());
    }

    Ok(Some(answers))
}

fn print_event(event: &Event, sse: bool) {
    if sse {
        print!("{}", event.to_sse_frame());
        return;
    }

    match &event.kind {
        EventKind::Token { text, .. } => println!("{}", text),
        EventKind::Phase { phase, status, .. } => {
            let status = match status {
                PhaseStatus::Start => "started",
                PhaseStatus::End => "finished",
            };
            eprintln!("[Phase {} {}]", phase, status);
        }
        EventKind::Artifact { artifact_type, uri, path, .. } => {
            eprintln!("[Artifact {}: {}]", artifact_type, uri.as_deref().unwrap_or(path));
        }
        EventKind::Elicitation { method, .. } => eprintln!("[Elicitation: {}]", method),
        EventKind::Error { message, .. } => eprintln!("[Error: {}]", message),
        EventKind::End { status, .. } => eprintln!("[End: {}]", status.as_str()),
        EventKind::Summary { .. }
        | EventKind::Answers { .. }
        | EventKind::Prompt { .. }
        | EventKind::Tool { .. } => {}
    }
}

/// Parse `key=value` pairs
fn parse_answer_pairs(pairs: &[String]) -> Result<Inputs> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Invalid answer (expected KEY=VALUE): {}", pair))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Answers from a JSON object file, or numbered free text otherwise
fn read_answers_file(path: &Path) -> Result<Inputs> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read answers file: {}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse answers file: {}", path.display()))
    } else {
        Ok(discovery::parse_numbered_answers(&content))
    }
}

fn parse_run_id(run_id: &str) -> Result<RunId> {
    if !RunId::is_well_formed(run_id) {
        anyhow::bail!("Invalid run ID: {}", run_id);
    }
    Ok(RunId::from(run_id))
}

fn journal_path(runs_root: &Path, run_id: &RunId) -> PathBuf {
    runs_root.join(run_id.as_str()).join("logs").join(EVENTS_FILE)
}

fn load_journal(run_id: &str) -> Result<(RunId, Vec<Event>)> {
    let run_id = parse_run_id(run_id)?;
    let path = journal_path(&config::runs_dir()?, &run_id);
    if !path.exists() {
        anyhow::bail!("No events found for run {}", run_id);
    }
    let events = replay_file(&path)?;
    Ok((run_id, events))
}

/// Show the status of a run
fn show_status(run_id: &str) -> Result<()> {
    let (run_id, events) = load_journal(run_id)?;
    let summary = RunSummary::from_events(&events)
        .with_context(|| format!("Run {} has an empty journal", run_id))?;

    println!("Run ID: {}", summary.run_id);
    println!("State: {}", summary.status.as_str());
    println!("Created: {}", summary.created_at);
    if let Some(finished) = summary.finished_at {
        println!("Finished: {}", finished);
    }
    if let Some(phase) = &summary.phase {
        println!("Phase: {}", phase);
    }
    if let Some(elapsed) = summary.elapsed_ms {
        println!("Elapsed: {}ms", elapsed);
    }
    if let Some(error) = &summary.error {
        println!("Error: {}", error);
    }
    println!("Events: {}", summary.event_count);
    if !summary.artifacts.is_empty() {
        println!("\nArtifacts:");
        for artifact in &summary.artifacts {
            println!("  {}", artifact);
        }
    }

    Ok(())
}

/// List recent runs
fn list_runs(limit: usize) -> Result<()> {
    let runs_root = config::runs_dir()?;
    let mut runs = Vec::new();

    if runs_root.exists() {
        for entry in std::fs::read_dir(&runs_root)
            .with_context(|| format!("Failed to read runs directory: {}", runs_root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !RunId::is_well_formed(&name) {
                continue;
            }
            let path = journal_path(&runs_root, &RunId::from(name));
            if let Some(summary) = replay_file(&path)
                .ok()
                .and_then(|events| RunSummary::from_events(&events))
            {
                runs.push(summary);
            }
        }
    }

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    println!("{:<34} {:<16} {:<16} {:<25}", "RUN ID", "PHASE", "STATE", "CREATED");
    println!("{}", "-".repeat(93));

    for run in runs.into_iter().take(limit) {
        println!(
            "{:<34} {:<16} {:<16} {:<25}",
            run.run_id,
            run.phase.as_deref().unwrap_or("-"),
            run.status.as_str(),
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Print a run's journal
fn show_events(run_id: &str, sse: bool) -> Result<()> {
    let (_, events) = load_journal(run_id)?;
    for event in &events {
        if sse {
            print!("{}", event.to_sse_frame());
        } else {
            println!("{}", serde_json::to_string(event)?);
        }
    }
    Ok(())
}

/// Show a workflow's state document
async fn show_state(workflow_id: &str) -> Result<()> {
    let cfg = config::config()?;
    let mut store = StateStore::for_workflow(&cfg.state_root, workflow_id)?;
    if let Some(template) = &cfg.workflow_template {
        store = store.with_template_file(template).await?;
    }

    let state = store.load().await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Arcindex Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:   {}", cfg.home.display());
    println!("  Runs:   {}", cfg.runs_root.display());
    println!("  State:  {}", cfg.state_root.display());
    println!(
        "  Template: {}",
        cfg.workflow_template
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(built-in)".to_string())
    );
    println!();
    println!("Workflow defaults:");
    println!("  Workflow type:  {}", cfg.default_workflow);
    println!("  Operation mode: {}", cfg.operation_mode);

    Ok(())
}
