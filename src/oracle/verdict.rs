//! Structured answers produced by the decision oracle.

use serde::{Deserialize, Serialize};

use crate::task::TaskStatus;

/// Ordinal task size, smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Trivial => "trivial",
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
            Complexity::VeryComplex => "very-complex",
        }
    }

    /// Accepts `very-complex`, `very_complex`, `Very Complex`.
    pub fn parse(raw: &str) -> Option<Complexity> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "trivial" => Some(Complexity::Trivial),
            "simple" => Some(Complexity::Simple),
            "moderate" | "medium" => Some(Complexity::Moderate),
            "complex" => Some(Complexity::Complex),
            "verycomplex" => Some(Complexity::VeryComplex),
            _ => None,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Should the task get a plan before an agent starts on it?
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanningDecision {
    pub needs_planning: bool,
    pub complexity: Complexity,
    pub rationale: String,
    pub size_estimate: Option<String>,
    pub confidence: f64,
    /// Sentinel produced without a usable model answer.
    pub fallback: bool,
}

impl PlanningDecision {
    /// Oracle disabled: go straight to work.
    pub fn skipped() -> Self {
        Self {
            needs_planning: false,
            complexity: Complexity::Moderate,
            rationale: "oracle disabled; planning check skipped".to_string(),
            size_estimate: None,
            confidence: 0.0,
            fallback: true,
        }
    }

    /// Oracle unavailable: ask a human for a plan.
    pub fn sentinel(reason: impl Into<String>) -> Self {
        Self {
            needs_planning: true,
            complexity: Complexity::Moderate,
            rationale: format!("oracle unavailable: {}", reason.into()),
            size_estimate: None,
            confidence: 0.0,
            fallback: true,
        }
    }
}

/// Did the session actually finish the task?
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionVerdict {
    pub actually_complete: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub recommended_status: TaskStatus,
    pub rationale: String,
    pub fallback: bool,
}

impl CompletionVerdict {
    pub fn sentinel(reason: impl Into<String>) -> Self {
        Self {
            actually_complete: false,
            confidence: 0.0,
            issues: Vec::new(),
            recommended_status: TaskStatus::NeedsReview,
            rationale: format!("completion could not be verified: {}", reason.into()),
            fallback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallStatus {
    Progressing,
    Stuck,
    Unclear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallRecommendation {
    Continue,
    Interrupt,
    Restart,
}

/// What to do about an agent that went quiet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StallVerdict {
    pub status: StallStatus,
    pub recommendation: StallRecommendation,
    pub suggested_message: Option<String>,
    pub confidence: f64,
    pub rationale: String,
    pub fallback: bool,
}

impl StallVerdict {
    pub fn sentinel(reason: impl Into<String>) -> Self {
        Self {
            status: StallStatus::Unclear,
            recommendation: StallRecommendation::Continue,
            suggested_message: None,
            confidence: 0.0,
            rationale: format!("stall could not be assessed: {}", reason.into()),
            fallback: true,
        }
    }
}

/// Any oracle answer, for audit logging.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OracleVerdict {
    Planning(PlanningDecision),
    Completion(CompletionVerdict),
    Stall(StallVerdict),
}

impl OracleVerdict {
    pub fn kind(&self) -> &'static str {
        match self {
            OracleVerdict::Planning(_) => "planning",
            OracleVerdict::Completion(_) => "completion",
            OracleVerdict::Stall(_) => "stall",
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            OracleVerdict::Planning(v) => v.confidence,
            OracleVerdict::Completion(v) => v.confidence,
            OracleVerdict::Stall(v) => v.confidence,
        }
    }

    pub fn is_fallback(&self) -> bool {
        match self {
            OracleVerdict::Planning(v) => v.fallback,
            OracleVerdict::Completion(v) => v.fallback,
            OracleVerdict::Stall(v) => v.fallback,
        }
    }
}
