//! Core Task type tracked by the controller.
//!
//! # Invariants
//! - `assigned_agent.is_some()` only while `status == InProgress`
//! - `identity` is unique within the record store
//! - `pending_write` is set whenever the local copy diverged from the last
//!   value written to or read from the record store

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::machine::{transition, CompletionOutcome, TaskEvent, TransitionError};
use crate::session::SessionId;
use crate::store::{StatusFields, TaskRow};

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    AwaitingPlanApproval,
    InProgress,
    NeedsReview,
    Completed,
    Incomplete,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::AwaitingPlanApproval => "awaiting_plan_approval",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::NeedsReview => "needs_review",
            TaskStatus::Completed => "completed",
            TaskStatus::Incomplete => "incomplete",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Parse the status column of a record.
    ///
    /// Accepts the snake_case names plus the spellings humans tend to type
    /// into a spreadsheet ("In Progress", "needs-review", "NeedsReview").
    pub fn parse_external(raw: &str) -> Option<TaskStatus> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "pending" | "todo" | "queued" => Some(TaskStatus::Pending),
            "awaitingplanapproval" | "awaitingapproval" | "planreview" => {
                Some(TaskStatus::AwaitingPlanApproval)
            }
            "inprogress" | "running" => Some(TaskStatus::InProgress),
            "needsreview" | "review" => Some(TaskStatus::NeedsReview),
            "completed" | "complete" | "done" => Some(TaskStatus::Completed),
            "incomplete" => Some(TaskStatus::Incomplete),
            "blocked" => Some(TaskStatus::Blocked),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of schedulable work, keyed by project name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    identity: String,
    priority: i64,
    status: TaskStatus,
    next_action: String,
    assigned_agent: Option<SessionId>,
    deadline: Option<DateTime<Utc>>,
    working_dir: Option<PathBuf>,
    plan_approved: bool,
    review_reason: Option<String>,
    last_transition_at: DateTime<Utc>,
    last_observed_revision: Option<String>,
    dispatch_failures: u32,
    last_stall_check_at: Option<DateTime<Utc>>,
    pending_write: bool,
}

impl Task {
    /// Build the in-memory task for a record seen for the first time.
    ///
    /// Session bindings do not survive a controller restart, so
    /// `assigned_agent` always starts empty.
    pub fn from_row(row: &TaskRow, now: DateTime<Utc>) -> Self {
        Self {
            identity: row.identity.clone(),
            priority: row.priority,
            status: row.parsed_status(),
            next_action: row.next_action.clone(),
            assigned_agent: None,
            deadline: row.deadline,
            working_dir: row.working_dir.as_ref().map(PathBuf::from),
            plan_approved: row.plan_approved,
            review_reason: row.note.clone(),
            last_transition_at: now,
            last_observed_revision: Some(row.revision.clone()),
            dispatch_failures: 0,
            last_stall_check_at: None,
            pending_write: false,
        }
    }

    // Getters

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn next_action(&self) -> &str {
        &self.next_action
    }

    pub fn assigned_agent(&self) -> Option<&SessionId> {
        self.assigned_agent.as_ref()
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn plan_approved(&self) -> bool {
        self.plan_approved
    }

    pub fn review_reason(&self) -> Option<&str> {
        self.review_reason.as_deref()
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    pub fn last_observed_revision(&self) -> Option<&str> {
        self.last_observed_revision.as_deref()
    }

    pub fn dispatch_failures(&self) -> u32 {
        self.dispatch_failures
    }

    pub fn last_stall_check_at(&self) -> Option<DateTime<Utc>> {
        self.last_stall_check_at
    }

    pub fn pending_write(&self) -> bool {
        self.pending_write
    }

    /// Whether the scheduler may start a session for this task.
    pub fn is_dispatchable(&self) -> bool {
        if self.assigned_agent.is_some() {
            return false;
        }
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::AwaitingPlanApproval => self.plan_approved,
            _ => false,
        }
    }

    /// Scheduling order: priority, then earliest deadline (none last), then identity.
    pub fn schedule_cmp(&self, other: &Task) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| match (self.deadline, other.deadline) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| self.identity.cmp(&other.identity))
    }

    // State transitions

    /// Apply an event through the state machine and update the dependent fields.
    ///
    /// Returns the previous status.
    pub fn apply(
        &mut self,
        event: &TaskEvent,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, TransitionError> {
        if self.status == TaskStatus::AwaitingPlanApproval
            && matches!(event, TaskEvent::Dispatched { .. })
            && !self.plan_approved
        {
            return Err(TransitionError::PlanNotApproved);
        }

        let previous = self.status;
        let next = transition(previous, event)?;
        let agent_before = self.assigned_agent.clone();
        let action_before = self.next_action.len();

        match event {
            TaskEvent::PlanRequired { .. } => {
                self.plan_approved = false;
            }
            TaskEvent::PlanApproved => {
                self.plan_approved = true;
            }
            TaskEvent::Dispatched { session_id } => {
                self.assigned_agent = Some(session_id.clone());
                self.dispatch_failures = 0;
                self.plan_approved = false;
                self.review_reason = None;
                self.last_stall_check_at = None;
            }
            TaskEvent::DispatchFailed {
                attempts, reason, ..
            } => {
                self.dispatch_failures = *attempts;
                if next == TaskStatus::NeedsReview {
                    self.review_reason = Some(format!(
                        "session failed to start {} times: {}",
                        attempts, reason
                    ));
                }
            }
            TaskEvent::SessionEnded { outcome } => match outcome {
                CompletionOutcome::Completed => self.review_reason = None,
                CompletionOutcome::NeedsReview { reason } => {
                    self.review_reason = Some(reason.clone());
                }
                CompletionOutcome::Incomplete { issues } => {
                    self.append_issues(issues);
                    self.review_reason = Some(issues.join("; "));
                }
            },
            TaskEvent::StallInterrupted => {
                self.last_stall_check_at = Some(now);
            }
            TaskEvent::StallRestarted { rationale } => {
                self.review_reason = Some(format!("restarted after stall: {}", rationale));
            }
            TaskEvent::SessionLost { reason } => {
                self.review_reason = Some(reason.clone());
            }
            TaskEvent::ExternalBlocked | TaskEvent::Requeue => {}
            TaskEvent::ExternalUnblocked => {
                self.dispatch_failures = 0;
            }
            TaskEvent::ExternalOverride { status } => {
                if *status == TaskStatus::Pending {
                    self.dispatch_failures = 0;
                }
                if *status != TaskStatus::NeedsReview {
                    self.review_reason = None;
                }
            }
        }

        if next != TaskStatus::InProgress {
            self.assigned_agent = None;
            self.last_stall_check_at = None;
        }

        let changed = next != previous
            || agent_before != self.assigned_agent
            || action_before != self.next_action.len();
        if next != previous {
            self.status = next;
            self.last_transition_at = now;
        }
        if changed && !event.echoes_store() {
            self.pending_write = true;
        }

        Ok(previous)
    }

    fn append_issues(&mut self, issues: &[String]) {
        if issues.is_empty() {
            return;
        }
        let mut appended = String::from("\n\nOutstanding issues from the previous attempt:");
        for issue in issues {
            appended.push_str("\n- ");
            appended.push_str(issue.trim());
        }
        self.next_action.push_str(&appended);
    }

    // Record store synchronisation

    /// Take external values for fields the controller does not own.
    pub fn absorb_row_metadata(&mut self, row: &TaskRow) {
        self.priority = row.priority;
        self.deadline = row.deadline;
        self.working_dir = row.working_dir.as_ref().map(PathBuf::from);
    }

    /// Replace the next action with the externally edited text.
    pub fn set_next_action(&mut self, next_action: impl Into<String>) {
        self.next_action = next_action.into();
    }

    /// Remember the revision seen in the latest fetch.
    pub fn observe_revision(&mut self, revision: impl Into<String>) {
        self.last_observed_revision = Some(revision.into());
    }

    /// Force the next write-back to re-assert the local state.
    pub fn mark_pending_write(&mut self) {
        self.pending_write = true;
    }

    /// Record a successful write-back.
    pub fn mark_written(&mut self, revision: impl Into<String>) {
        self.last_observed_revision = Some(revision.into());
        self.pending_write = false;
    }

    /// Record that the oracle was asked about a stall, even if nothing changed.
    pub fn mark_stall_checked(&mut self, at: DateTime<Utc>) {
        self.last_stall_check_at = Some(at);
    }

    /// Fields the controller writes back to the record store.
    pub fn status_fields(&self) -> StatusFields {
        StatusFields {
            status: self.status,
            next_action: self.next_action.clone(),
            assigned_agent: self.assigned_agent.as_ref().map(|s| s.to_string()),
            note: self.review_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(identity: &str, priority: i64, status: Option<&str>) -> TaskRow {
        TaskRow::new(identity, priority, status, "fix typo")
    }

    #[test]
    fn parses_human_spellings() {
        assert_eq!(
            TaskStatus::parse_external("In Progress"),
            Some(TaskStatus::InProgress)
        );
        assert_eq!(
            TaskStatus::parse_external("needs-review"),
            Some(TaskStatus::NeedsReview)
        );
        assert_eq!(
            TaskStatus::parse_external("AwaitingPlanApproval"),
            Some(TaskStatus::AwaitingPlanApproval)
        );
        assert_eq!(TaskStatus::parse_external("whatever"), None);
        // Approval lives in the plan_approved column, not in the status.
        assert_eq!(TaskStatus::parse_external("approved"), None);
    }

    #[test]
    fn unknown_status_defaults_to_pending() {
        let task = Task::from_row(&row("p1", 1, Some("???")), Utc::now());
        assert_eq!(task.status(), TaskStatus::Pending);
        let task = Task::from_row(&row("p1", 1, None), Utc::now());
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[test]
    fn schedule_order_uses_priority_deadline_identity() {
        let now = Utc::now();
        let mut a = Task::from_row(&row("b", 1, None), now);
        let mut b = Task::from_row(&row("a", 1, None), now);
        assert_eq!(a.schedule_cmp(&b), Ordering::Greater);

        a.deadline = Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(a.schedule_cmp(&b), Ordering::Less);

        b.priority = 0;
        assert_eq!(a.schedule_cmp(&b), Ordering::Greater);
    }

    #[test]
    fn dispatch_binds_agent_and_leaving_clears_it() {
        let now = Utc::now();
        let mut task = Task::from_row(&row("p1", 1, None), now);
        task.apply(
            &TaskEvent::Dispatched {
                session_id: SessionId::from("s1"),
            },
            now,
        )
        .unwrap();
        assert_eq!(task.status(), TaskStatus::InProgress);
        assert_eq!(task.assigned_agent().map(|s| s.as_str()), Some("s1"));
        assert!(task.pending_write());

        task.apply(
            &TaskEvent::SessionEnded {
                outcome: CompletionOutcome::Completed,
            },
            now,
        )
        .unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.assigned_agent().is_none());
    }

    #[test]
    fn incomplete_appends_issues_to_next_action() {
        let now = Utc::now();
        let mut task = Task::from_row(&row("p2", 2, None), now);
        task.apply(
            &TaskEvent::Dispatched {
                session_id: SessionId::from("s1"),
            },
            now,
        )
        .unwrap();
        task.apply(
            &TaskEvent::SessionEnded {
                outcome: CompletionOutcome::Incomplete {
                    issues: vec!["missing tests".into()],
                },
            },
            now,
        )
        .unwrap();
        assert_eq!(task.status(), TaskStatus::Incomplete);
        assert!(task.next_action().starts_with("fix typo"));
        assert!(task.next_action().contains("missing tests"));
    }

    #[test]
    fn unapproved_plan_cannot_dispatch() {
        let now = Utc::now();
        let mut task = Task::from_row(&row("p3", 1, Some("awaiting_plan_approval")), now);
        assert!(!task.is_dispatchable());
        let err = task
            .apply(
                &TaskEvent::Dispatched {
                    session_id: SessionId::from("s1"),
                },
                now,
            )
            .unwrap_err();
        assert_eq!(err, TransitionError::PlanNotApproved);

        task.apply(&TaskEvent::PlanApproved, now).unwrap();
        assert!(task.is_dispatchable());
        assert!(!task.pending_write());
    }

    #[test]
    fn external_override_does_not_schedule_a_write() {
        let now = Utc::now();
        let mut task = Task::from_row(&row("p4", 1, Some("needs_review")), now);
        task.apply(
            &TaskEvent::ExternalOverride {
                status: TaskStatus::Pending,
            },
            now,
        )
        .unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(!task.pending_write());
        assert!(task.review_reason().is_none());
    }
}
