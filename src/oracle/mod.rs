//! Decision oracle.
//!
//! Asks a language model three kinds of structured question (does this task
//! need a plan, is this session's work really done, what to do about a quiet
//! agent) and turns the free-text answers into validated verdicts.
//!
//! The oracle never fails from the caller's point of view: timeouts, backend
//! errors and malformed answers are retried, and when the attempts run out
//! a conservative sentinel verdict comes back instead. Every verdict is
//! written to the `foreman::audit` log target.

mod parse;
pub mod prompts;
pub mod verdict;

pub use verdict::{
    Complexity, CompletionVerdict, OracleVerdict, PlanningDecision, StallRecommendation,
    StallStatus, StallVerdict,
};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::OracleConfig;
use crate::llm::{LlmBackend, LlmError};
use crate::session::Evidence;
use crate::task::{CompletionOutcome, Task, TaskStatus};

/// Sent to an interrupted agent when the model did not suggest anything.
pub const DEFAULT_GUIDANCE: &str = "You seem to have stopped making progress. Summarise where \
you are, run the tests, and either finish the remaining work or explain what is blocking you.";

/// Why a single oracle call produced no verdict. Never leaves this module.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("backend failure: {0}")]
    Backend(#[from] LlmError),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl OracleError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            OracleError::Backend(e) => e.retry_after,
            _ => None,
        }
    }
}

pub struct DecisionOracle {
    backend: Option<Arc<dyn LlmBackend>>,
    config: OracleConfig,
}

impl DecisionOracle {
    pub fn new(backend: Arc<dyn LlmBackend>, config: OracleConfig) -> Self {
        Self {
            backend: Some(backend),
            config,
        }
    }

    /// Oracle that skips planning and sends every completion to review.
    pub fn disabled(config: OracleConfig) -> Self {
        Self {
            backend: None,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.backend.is_some()
    }

    fn backoff(&self, attempt: u32, error: &OracleError) -> Duration {
        let exponential = self
            .config
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        error
            .retry_after()
            .unwrap_or(exponential)
            .min(self.config.retry_max_delay)
    }

    /// Ask until a valid answer arrives or the attempts run out.
    async fn ask<T>(
        &self,
        kind: &'static str,
        identity: &str,
        prompt: &str,
        parser: fn(&str) -> Result<T, OracleError>,
    ) -> Result<T, OracleError> {
        let Some(backend) = self.backend.as_ref() else {
            return Err(OracleError::Backend(LlmError::network_error(
                "no backend configured",
            )));
        };

        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let call = backend.complete(prompt, self.config.temperature);
            let result = match tokio::time::timeout(self.config.call_timeout, call).await {
                Err(_) => Err(OracleError::Timeout(self.config.call_timeout)),
                Ok(Err(e)) => Err(OracleError::Backend(e)),
                Ok(Ok(text)) => parser(&text),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            attempt += 1;
            warn!(
                task = identity,
                kind,
                attempt,
                max_attempts = attempts,
                backend = backend.name(),
                "Oracle call failed: {}",
                error
            );
            if attempt >= attempts {
                return Err(error);
            }
            tokio::time::sleep(self.backoff(attempt - 1, &error)).await;
        }
    }

    fn audit(&self, identity: &str, verdict: &OracleVerdict) {
        info!(
            target: "foreman::audit",
            task = identity,
            kind = verdict.kind(),
            confidence = verdict.confidence(),
            fallback = verdict.is_fallback(),
            verdict = %serde_json::to_string(verdict).unwrap_or_default(),
            "Oracle verdict"
        );
    }

    /// Decide whether `task` needs an approved plan before dispatch.
    pub async fn plan(&self, task: &Task) -> PlanningDecision {
        if !self.is_enabled() {
            return PlanningDecision::skipped();
        }

        let prompt = prompts::planning(task.identity(), task.next_action());
        let decision = match self
            .ask("planning", task.identity(), &prompt, parse::planning)
            .await
        {
            Ok(mut decision) => {
                if decision.complexity >= self.config.plan_threshold && !decision.needs_planning {
                    debug!(
                        task = task.identity(),
                        complexity = %decision.complexity,
                        "Complexity at or above threshold, forcing a plan"
                    );
                    decision.needs_planning = true;
                }
                decision
            }
            Err(e) => PlanningDecision::sentinel(e.to_string()),
        };

        self.audit(task.identity(), &OracleVerdict::Planning(decision.clone()));
        decision
    }

    /// Judge the work a finished session left behind.
    pub async fn verify_completion(&self, task: &Task, evidence: &Evidence) -> CompletionVerdict {
        let verdict = if self.is_enabled() {
            let prompt = prompts::completion(task.identity(), task.next_action(), evidence);
            match self
                .ask("completion", task.identity(), &prompt, parse::completion)
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => CompletionVerdict::sentinel(e.to_string()),
            }
        } else {
            CompletionVerdict::sentinel("oracle disabled")
        };

        self.audit(task.identity(), &OracleVerdict::Completion(verdict.clone()));
        verdict
    }

    /// Decide what to do about a session that went quiet.
    pub async fn assess_stall(
        &self,
        task: &Task,
        elapsed: Duration,
        idle: Duration,
        tail: &[String],
    ) -> StallVerdict {
        let verdict = if self.is_enabled() {
            let prompt = prompts::stall(task.identity(), task.next_action(), elapsed, idle, tail);
            match self
                .ask("stall", task.identity(), &prompt, parse::stall)
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => StallVerdict::sentinel(e.to_string()),
            }
        } else {
            StallVerdict::sentinel("oracle disabled")
        };

        self.audit(task.identity(), &OracleVerdict::Stall(verdict.clone()));
        verdict
    }

    /// Map a completion verdict onto the task outcome.
    ///
    /// Low confidence always means review; nothing is marked Completed
    /// without a confident, consistent verdict.
    pub fn completion_outcome(&self, verdict: &CompletionVerdict) -> CompletionOutcome {
        if verdict.fallback {
            return CompletionOutcome::NeedsReview {
                reason: verdict.rationale.clone(),
            };
        }
        if verdict.confidence < self.config.confidence_threshold {
            return CompletionOutcome::NeedsReview {
                reason: format!(
                    "low confidence ({:.2} < {:.2}): {}",
                    verdict.confidence, self.config.confidence_threshold, verdict.rationale
                ),
            };
        }

        match (verdict.actually_complete, verdict.recommended_status) {
            (_, TaskStatus::NeedsReview) => CompletionOutcome::NeedsReview {
                reason: format!("reviewer recommended: {}", verdict.rationale),
            },
            (true, TaskStatus::Completed) => CompletionOutcome::Completed,
            (true, _) => CompletionOutcome::NeedsReview {
                reason: format!(
                    "verdict says complete but recommends {}: {}",
                    verdict.recommended_status, verdict.rationale
                ),
            },
            (false, _) if !verdict.issues.is_empty() => CompletionOutcome::Incomplete {
                issues: verdict.issues.clone(),
            },
            (false, _) => CompletionOutcome::NeedsReview {
                reason: format!("not complete, no actionable issues: {}", verdict.rationale),
            },
        }
    }
}

/// Message to send for an interrupt verdict.
pub fn interrupt_message(verdict: &StallVerdict) -> &str {
    verdict
        .suggested_message
        .as_deref()
        .unwrap_or(DEFAULT_GUIDANCE)
}
