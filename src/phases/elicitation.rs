//! Advanced elicitation menu.
//!
//! Option 1 always proceeds; options 2-9 are reflective techniques applied
//! to the collected inputs before the phase runs.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunError};

/// Label of the option that skips refinement
pub const PROCEED_LABEL: &str = "Proceed to next phase";

const FALLBACK_DESCRIPTION: &str = "Apply the selected elicitation technique.";

const DEFAULT_METHODS: [(&str, &str); 8] = [
    (
        "Expand or Contract for Audience",
        "Adjust depth and vocabulary to the people who will read the result.",
    ),
    (
        "Critique and Refine",
        "Review the answers for gaps and inconsistencies, then tighten them.",
    ),
    (
        "Identify Potential Risks and Unforeseen Issues",
        "List what could go wrong and which assumptions are untested.",
    ),
    (
        "Assess Alignment with Overall Goals",
        "Check each answer against the stated success criteria.",
    ),
    (
        "Tree of Thoughts Deep Dive",
        "Explore alternative directions and compare where each leads.",
    ),
    (
        "Stakeholder Round Table",
        "Restate the plan from the viewpoint of each stakeholder.",
    ),
    (
        "Self-Consistency Validation",
        "Derive the conclusion several ways and compare the results.",
    ),
    ("ReWOO (Reasoning Without Observation)", FALLBACK_DESCRIPTION),
];

/// A single numbered menu entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElicitationOption {
    pub number: u32,
    pub label: String,
    pub description: String,
}

impl ElicitationOption {
    /// True for option 1
    pub fn is_proceed(&self) -> bool {
        self.number == 1
    }

    /// `N. Label`
    pub fn as_line(&self) -> String {
        format!("{}. {}", self.number, self.label)
    }
}

/// The nine-option elicitation menu
#[derive(Debug, Clone)]
pub struct ElicitationMenu {
    options: Vec<ElicitationOption>,
}

impl Default for ElicitationMenu {
    fn default() -> Self {
        Self::new()
    }
}

impl ElicitationMenu {
    pub fn new() -> Self {
        let mut options = vec![ElicitationOption {
            number: 1,
            label: PROCEED_LABEL.to_string(),
            description: "Move forward without further refinement.".to_string(),
        }];
        options.extend(DEFAULT_METHODS.iter().enumerate().map(|(index, (label, description))| {
            ElicitationOption {
                number: index as u32 + 2,
                label: label.to_string(),
                description: description.to_string(),
            }
        }));
        Self { options }
    }

    pub fn options(&self) -> &[ElicitationOption] {
        &self.options
    }

    /// Look up a selection, rejecting numbers outside 1-9
    pub fn option(&self, number: u32) -> Result<&ElicitationOption> {
        self.options
            .iter()
            .find(|option| option.number == number)
            .ok_or(RunError::InvalidElicitation(number))
    }

    /// Menu text shown to an interactive caller
    pub fn format(&self) -> String {
        let mut lines = vec![
            "**Advanced Elicitation Options**".to_string(),
            "Select 1-9 or type your feedback:".to_string(),
            String::new(),
        ];
        lines.extend(self.options.iter().map(ElicitationOption::as_line));
        lines.join("\n")
    }
}
