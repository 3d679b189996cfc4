//! Pure transition function for task status.
//!
//! # State Machine
//! ```text
//! Pending ──plan required──▶ AwaitingPlanApproval ──approved + dispatched──┐
//!    │                                                                     ▼
//!    └──────────────────────── dispatched ─────────────────────────▶ InProgress
//!                                                                          │
//!        ┌──────────── session ended / stall restart ──────────────────────┤
//!        ▼                                                                 │
//! Completed | NeedsReview | Incomplete ──requeue──▶ Pending                │
//!                                                                          │
//! any ──external Blocked──▶ Blocked ──external cleared──▶ Pending          │
//! InProgress ──session lost──▶ Pending ◀───────────────────────────────────┘
//! ```
//!
//! Side effects (starting or stopping sessions, calling the oracle) happen
//! around a transition in the scheduler, never inside it.

use super::task::TaskStatus;
use crate::session::SessionId;

/// Outcome of completion verification for a session that ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// Verified complete with sufficient confidence.
    Completed,
    /// A human has to look at it.
    NeedsReview { reason: String },
    /// Not done yet; the issues are appended to the next action.
    Incomplete { issues: Vec<String> },
}

/// Everything that can move a task between states.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Oracle decided the task needs a plan before work starts.
    PlanRequired { rationale: String },
    /// External approval of the plan arrived.
    PlanApproved,
    /// A session was started for the task.
    Dispatched { session_id: SessionId },
    /// Starting a session failed. `attempts` counts consecutive failures including this one.
    DispatchFailed {
        attempts: u32,
        max_attempts: u32,
        reason: String,
    },
    /// The bound session ended and was verified.
    SessionEnded { outcome: CompletionOutcome },
    /// Stall verdict: guidance was sent, the session stays bound.
    StallInterrupted,
    /// Stall verdict: the session was stopped.
    StallRestarted { rationale: String },
    /// No live session backs an InProgress task.
    SessionLost { reason: String },
    /// The record store marked the task Blocked.
    ExternalBlocked,
    /// The record store cleared a Blocked status.
    ExternalUnblocked,
    /// A human edited the status column.
    ExternalOverride { status: TaskStatus },
    /// An Incomplete task re-enters the queue.
    Requeue,
}

impl TaskEvent {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            TaskEvent::PlanRequired { .. } => "plan_required",
            TaskEvent::PlanApproved => "plan_approved",
            TaskEvent::Dispatched { .. } => "dispatched",
            TaskEvent::DispatchFailed { .. } => "dispatch_failed",
            TaskEvent::SessionEnded { .. } => "session_ended",
            TaskEvent::StallInterrupted => "stall_interrupted",
            TaskEvent::StallRestarted { .. } => "stall_restarted",
            TaskEvent::SessionLost { .. } => "session_lost",
            TaskEvent::ExternalBlocked => "external_blocked",
            TaskEvent::ExternalUnblocked => "external_unblocked",
            TaskEvent::ExternalOverride { .. } => "external_override",
            TaskEvent::Requeue => "requeue",
        }
    }

    /// Events that mirror a value already present in the record store.
    pub(crate) fn echoes_store(&self) -> bool {
        matches!(
            self,
            TaskEvent::ExternalOverride { .. } | TaskEvent::PlanApproved
        )
    }
}

/// Rejected transition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("event {event} is not valid in state {from}")]
    InvalidTransition { from: TaskStatus, event: &'static str },

    #[error("task is bound to a running session; only Blocked may preempt it")]
    LocalAuthority,

    #[error("plan has not been approved")]
    PlanNotApproved,
}

/// Compute the next status for `event` in state `from`.
///
/// Pure: no I/O, no clock, no task fields other than the status.
pub fn transition(from: TaskStatus, event: &TaskEvent) -> Result<TaskStatus, TransitionError> {
    use TaskStatus::*;

    let invalid = || TransitionError::InvalidTransition {
        from,
        event: event.label(),
    };

    match (from, event) {
        (_, TaskEvent::ExternalBlocked) => Ok(Blocked),
        (Blocked, TaskEvent::ExternalUnblocked) => Ok(Pending),
        (_, TaskEvent::ExternalUnblocked) => Err(invalid()),

        (InProgress, TaskEvent::ExternalOverride { status }) if *status != Blocked => {
            Err(TransitionError::LocalAuthority)
        }
        (Blocked, TaskEvent::ExternalOverride { .. }) => Err(invalid()),
        (_, TaskEvent::ExternalOverride { status: InProgress }) => Err(invalid()),
        (_, TaskEvent::ExternalOverride { status }) => Ok(*status),

        (Pending, TaskEvent::PlanRequired { .. }) => Ok(AwaitingPlanApproval),
        (AwaitingPlanApproval, TaskEvent::PlanApproved) => Ok(AwaitingPlanApproval),
        (Pending, TaskEvent::PlanApproved) => Ok(Pending),

        (Pending | AwaitingPlanApproval, TaskEvent::Dispatched { .. }) => Ok(InProgress),
        (
            Pending | AwaitingPlanApproval,
            TaskEvent::DispatchFailed {
                attempts,
                max_attempts,
                ..
            },
        ) => {
            if attempts >= max_attempts {
                Ok(NeedsReview)
            } else {
                Ok(from)
            }
        }

        (InProgress, TaskEvent::SessionEnded { outcome }) => Ok(match outcome {
            CompletionOutcome::Completed => Completed,
            CompletionOutcome::NeedsReview { .. } => NeedsReview,
            CompletionOutcome::Incomplete { .. } => Incomplete,
        }),
        (InProgress, TaskEvent::StallInterrupted) => Ok(InProgress),
        (InProgress, TaskEvent::StallRestarted { .. }) => Ok(Incomplete),
        (InProgress, TaskEvent::SessionLost { .. }) => Ok(Pending),

        (Incomplete, TaskEvent::Requeue) => Ok(Pending),

        _ => Err(invalid()),
    }
}
