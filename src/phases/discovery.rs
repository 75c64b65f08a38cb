//! Built-in discovery phase.
//!
//! Collects answers to nine project questions, renders a markdown summary,
//! and persists both the summary and a structured JSON payload as
//! artifacts. The structured fields are merged into the workflow state's
//! `project_discovery` section.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::core::{iso_timestamp, RunContext};
use crate::domain::{ArtifactOptions, EventKind, Question, TokenChannel};

use super::{Inputs, PhaseExecutor, PhaseOutput};

pub const PHASE: &str = "discovery";
pub const NEXT_PHASE: &str = "analyst";
pub const SUMMARY_ARTIFACT: &str = "discovery_summary";

const NOT_PROVIDED: &str = "Not provided";

struct DiscoveryQuestion {
    number: u32,
    key: &'static str,
    prompt: &'static str,
    skip_if_named: bool,
}

const QUESTIONS: [DiscoveryQuestion; 9] = [
    DiscoveryQuestion {
        number: 1,
        key: "project_name",
        prompt: "Project Name/Working Title",
        skip_if_named: true,
    },
    DiscoveryQuestion {
        number: 2,
        key: "project_concept",
        prompt: "Brief Project Concept: What are you building with {project_name}? \
                 Describe the core problem you're solving, who will use it, and the primary functionality. \
                 (2-3 paragraphs)",
        skip_if_named: false,
    },
    DiscoveryQuestion {
        number: 3,
        key: "target_users",
        prompt: "Target Users & Pain Points: Who are your target users, and what specific pain points or \
                 challenges are they currently experiencing that this project addresses? \
                 What makes these pain points significant enough to warrant this solution?",
        skip_if_named: false,
    },
    DiscoveryQuestion {
        number: 4,
        key: "user_research_status",
        prompt: "User Research Status: What user research has been conducted so far (interviews, surveys, \
                 market analysis)? If none yet, what research do you plan to conduct, and how will you \
                 validate user needs before building?",
        skip_if_named: false,
    },
    DiscoveryQuestion {
        number: 5,
        key: "competitive_landscape",
        prompt: "Competitive Landscape: Who are the main competitors or alternative solutions in this space? \
                 What are their key strengths and weaknesses? How will your solution differentiate itself \
                 from existing options?",
        skip_if_named: false,
    },
    DiscoveryQuestion {
        number: 6,
        key: "market_opportunities",
        prompt: "Market Opportunity: What market trends, gaps, or opportunities is this project addressing? \
                 Why is now the right time to build this solution? What evidence supports the market demand?",
        skip_if_named: false,
    },
    DiscoveryQuestion {
        number: 7,
        key: "technical_constraints",
        prompt: "Technical Platform & Language: What are the must-have technical constraints for this project? \
                 Specify target platform(s) (iOS, Android, Web, Backend Service, etc.), required programming \
                 languages, and any framework preferences or organizational standards that must be followed.",
        skip_if_named: false,
    },
    DiscoveryQuestion {
        number: 8,
        key: "integration_requirements",
        prompt: "Integration Requirements: What existing systems, APIs, or third-party services must this \
                 project integrate with? Are there any authentication, data format, or protocol requirements \
                 for these integrations?",
        skip_if_named: false,
    },
    DiscoveryQuestion {
        number: 9,
        key: "success_criteria",
        prompt: "Success Criteria & Constraints: How will you measure success for this project? \
                 What are the critical success factors, timeline constraints, budget considerations, and any \
                 other limitations (regulatory, compliance, organizational) that will shape the solution?",
        skip_if_named: false,
    },
];

/// Discovery phase executor
#[derive(Debug, Clone, Default)]
pub struct DiscoveryPhase;

impl DiscoveryPhase {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PhaseExecutor for DiscoveryPhase {
    fn phase(&self) -> &str {
        PHASE
    }

    fn next_phase(&self) -> Option<&str> {
        Some(NEXT_PHASE)
    }

    fn questionnaire(&self, project_name: Option<&str>) -> Vec<Question> {
        questionnaire(project_name)
    }

    fn preview(&self, inputs: &Inputs, project_name: Option<&str>) -> String {
        summary_markdown(inputs, project_name)
    }

    async fn execute(&self, ctx: &RunContext, inputs: &Inputs) -> Result<PhaseOutput> {
        let timestamp = iso_timestamp(Utc::now());
        let project_name = inputs.get("project_name").map(String::as_str);
        let markdown = summary_markdown(inputs, project_name);

        for line in markdown.lines() {
            ctx.emit(EventKind::Token {
                agent: PHASE.to_string(),
                channel: TokenChannel::Stdout,
                text: line.to_string(),
            })?;
        }

        let summary_md = ctx
            .write_text(
                SUMMARY_ARTIFACT,
                &markdown,
                ArtifactOptions::new()
                    .phase(PHASE)
                    .agent(PHASE)
                    .metadata(json!({"source": PHASE, "format": "markdown"})),
            )
            .await
            .context("Failed to persist discovery summary markdown")?;

        let payload = summary_payload(inputs, ctx.run_id().as_str(), &timestamp);
        let summary_json = ctx
            .write_json(
                SUMMARY_ARTIFACT,
                &payload,
                ArtifactOptions::new()
                    .phase(PHASE)
                    .agent(PHASE)
                    .metadata(json!({"source": PHASE, "format": "json"})),
            )
            .await
            .context("Failed to persist discovery summary payload")?;

        let mut fields = Map::new();
        for field in [
            "project_scope",
            "target_users",
            "user_research_status",
            "competitive_landscape",
            "market_opportunities",
            "technical_constraints",
            "integration_requirements",
            "success_criteria",
            "business_goals",
        ] {
            fields.insert(field.to_string(), payload[field]["content"].clone());
        }
        for key in ["project_name", "project_concept"] {
            if let Some(value) = answer(inputs, key) {
                fields.insert(key.to_string(), json!(value));
            }
        }
        fields.insert("discovery_summary_path".to_string(), json!(summary_json.uri));
        fields.insert("discovery_completed".to_string(), json!(true));
        fields.insert("discovery_timestamp".to_string(), json!(timestamp));

        Ok(PhaseOutput::new(markdown)
            .with_artifact(summary_md)
            .with_artifact(summary_json)
            .with_state("project_discovery", fields))
    }
}

/// Ordered questions; question 1 is skipped once the project is named
pub fn questionnaire(project_name: Option<&str>) -> Vec<Question> {
    let name = project_name.filter(|n| !n.trim().is_empty());
    let substitute = name.unwrap_or("this project");

    QUESTIONS
        .iter()
        .filter(|q| !(q.skip_if_named && name.is_some()))
        .map(|q| Question {
            number: q.number,
            key: q.key.to_string(),
            prompt: q.prompt.replace("{project_name}", substitute),
        })
        .collect()
}

/// Prompt block listing every outstanding question
pub fn format_questions(project_name: Option<&str>) -> String {
    let lines: Vec<String> = questionnaire(project_name)
        .iter()
        .map(|q| format!("{}. {}", q.number, q.prompt))
        .collect();

    format!(
        "📋 Discovery Questions\n\nPlease provide answers to the following:\n\n{}\n\n\
         Please provide comprehensive answers to all questions.",
        lines.join("\n")
    )
}

/// Split a free-form reply of the form `1. ... 2) ... 3: ...` into keyed answers.
///
/// Unknown question numbers are ignored.
pub fn parse_numbered_answers(text: &str) -> Inputs {
    let mut answers = Inputs::new();
    let mut current: Option<(&'static str, Vec<&str>)> = None;

    for line in text.lines() {
        match split_numbered(line) {
            Some((number, rest)) => {
                flush(&mut current, &mut answers);
                current = QUESTIONS
                    .iter()
                    .find(|q| q.number == number)
                    .map(|q| (q.key, vec![rest]));
            }
            None => {
                if let Some((_, lines)) = current.as_mut() {
                    lines.push(line);
                }
            }
        }
    }
    flush(&mut current, &mut answers);

    answers
}

fn flush(current: &mut Option<(&'static str, Vec<&str>)>, answers: &mut Inputs) {
    if let Some((key, lines)) = current.take() {
        answers.insert(key.to_string(), lines.join("\n").trim().to_string());
    }
}

fn split_numbered(line: &str) -> Option<(u32, &str)> {
    let trimmed = line.trim_start();
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let number = trimmed[..digits].parse().ok()?;
    let rest = &trimmed[digits..];
    let mut chars = rest.chars();
    match chars.next() {
        Some(')' | '.' | '-' | ':') => Some((number, chars.as_str().trim_start())),
        _ => None,
    }
}

/// Deterministic markdown summary of the collected answers
pub fn summary_markdown(inputs: &Inputs, project_name: Option<&str>) -> String {
    let name = project_name
        .filter(|n| !n.is_empty())
        .or_else(|| answer(inputs, "project_name"))
        .unwrap_or("TBD");

    let lines = [
        "📋 Discovery Summary".to_string(),
        String::new(),
        format!("- **Project Name:** {}", name),
        format!("- **Concept:** {}", fallback(inputs, "project_concept")),
        format!("- **Target Users:** {}", fallback(inputs, "target_users")),
        format!("- **Research Status:** {}", fallback(inputs, "user_research_status")),
        format!("- **Competitive Landscape:** {}", fallback(inputs, "competitive_landscape")),
        format!("- **Market Opportunity:** {}", fallback(inputs, "market_opportunities")),
        format!("- **Technical Constraints:** {}", fallback(inputs, "technical_constraints")),
        format!("- **Integration Requirements:** {}", fallback(inputs, "integration_requirements")),
        format!("- **Success Criteria:** {}", fallback(inputs, "success_criteria")),
    ];
    lines.join("\n")
}

/// Structured summary written as the JSON artifact
pub fn summary_payload(inputs: &Inputs, run_id: &str, timestamp: &str) -> Value {
    let business_goals: Vec<&str> = ["market_opportunities", "success_criteria"]
        .iter()
        .filter_map(|key| answer(inputs, key))
        .collect();
    let business_goals = if business_goals.is_empty() {
        None
    } else {
        Some(business_goals.join("\n\n"))
    };

    json!({
        "project_scope": entry(answer(inputs, "project_concept"), false, Some("2")),
        "target_users": entry(answer(inputs, "target_users"), true, Some("3")),
        "user_research_status": entry(answer(inputs, "user_research_status"), false, Some("4")),
        "competitive_landscape": entry(answer(inputs, "competitive_landscape"), false, Some("5")),
        "market_opportunities": entry(answer(inputs, "market_opportunities"), false, Some("6")),
        "technical_constraints": entry(answer(inputs, "technical_constraints"), false, Some("7")),
        "integration_requirements": entry(answer(inputs, "integration_requirements"), true, Some("8")),
        "success_criteria": entry(answer(inputs, "success_criteria"), true, Some("9")),
        "business_goals": entry(business_goals.as_deref(), false, None),
        "discovery_metadata": {
            "timestamp": timestamp,
            "run_id": run_id,
            "questions_answered": inputs.values().filter(|v| !v.trim().is_empty()).count(),
            "elicitation_rounds": 0,
        },
    })
}

fn entry(content: Option<&str>, bulletize: bool, question: Option<&str>) -> Value {
    let items = match (bulletize, content) {
        (true, Some(text)) => bullet_items(text),
        _ => Vec::new(),
    };
    json!({
        "content": content,
        "items": items,
        "source_question": question,
    })
}

fn bullet_items(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .map(str::trim)
                .unwrap_or(line)
                .to_string()
        })
        .collect()
}

fn answer<'a>(inputs: &'a Inputs, key: &str) -> Option<&'a str> {
    inputs
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
}

fn fallback<'a>(inputs: &'a Inputs, key: &str) -> &'a str {
    answer(inputs, key).unwrap_or(NOT_PROVIDED)
}
