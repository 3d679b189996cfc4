//! Selection, plan check and session start.

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{alert_stop_failure, CycleReport, Scheduler};
use crate::oracle::{DecisionOracle, PlanningDecision};
use crate::session::{SessionError, SessionId, SessionManager};
use crate::task::{Task, TaskEvent, TaskStatus};

enum DispatchOutcome {
    PlanRequired(PlanningDecision),
    Started(SessionId),
    StartFailed(SessionError),
}

async fn plan_and_start(
    oracle: &DecisionOracle,
    sessions: &SessionManager,
    task: &Task,
) -> DispatchOutcome {
    if task.status() == TaskStatus::Pending && !task.plan_approved() {
        let decision = oracle.plan(task).await;
        if decision.needs_planning {
            return DispatchOutcome::PlanRequired(decision);
        }
    }

    match sessions.start(task).await {
        Ok(id) => DispatchOutcome::Started(id),
        Err(e) => DispatchOutcome::StartFailed(e),
    }
}

impl Scheduler {
    fn free_slots(&self, active: usize) -> usize {
        self.config.max_concurrent_sessions.saturating_sub(active)
    }

    /// Fill free session slots in scheduling order.
    ///
    /// Candidates are handled in waves no larger than the free slot count,
    /// so a task routed to plan approval frees its slot for the next one.
    pub(super) async fn dispatch(&mut self, report: &mut CycleReport) {
        let mut candidates: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.is_dispatchable())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.schedule_cmp(b));
        let mut queue = candidates.into_iter();

        loop {
            let free = self.free_slots(self.sessions.active_count().await);
            if free == 0 {
                break;
            }
            let wave: Vec<Task> = queue.by_ref().take(free).collect();
            if wave.is_empty() {
                break;
            }

            let oracle = self.oracle.as_ref();
            let sessions = self.sessions.as_ref();
            let outcomes =
                join_all(wave.iter().map(|task| plan_and_start(oracle, sessions, task))).await;

            for (task, outcome) in wave.iter().zip(outcomes) {
                self.apply_dispatch(task.identity(), outcome, report).await;
            }
        }
    }

    async fn apply_dispatch(
        &mut self,
        identity: &str,
        outcome: DispatchOutcome,
        report: &mut CycleReport,
    ) {
        let now = Utc::now();
        let max_attempts = self.config.max_dispatch_attempts;
        let Some(task) = self.tasks.get_mut(identity) else {
            if let DispatchOutcome::Started(id) = outcome {
                if let Err(e) = self.sessions.stop(&id).await {
                    alert_stop_failure(&id, identity, &e);
                }
            }
            return;
        };

        match outcome {
            DispatchOutcome::PlanRequired(decision) => {
                let event = TaskEvent::PlanRequired {
                    rationale: decision.rationale.clone(),
                };
                if task.apply(&event, now).is_ok() {
                    info!(
                        task = identity,
                        complexity = %decision.complexity,
                        fallback = decision.fallback,
                        "Plan required before dispatch"
                    );
                    report.plans_requested += 1;
                }
            }
            DispatchOutcome::Started(id) => {
                let event = TaskEvent::Dispatched {
                    session_id: id.clone(),
                };
                match task.apply(&event, now) {
                    Ok(_) => {
                        info!(task = identity, session = %id, "Task dispatched");
                        report.dispatched += 1;
                    }
                    Err(e) => {
                        warn!(task = identity, session = %id, "Started session rejected: {}", e);
                        if let Err(e) = self.sessions.stop(&id).await {
                            alert_stop_failure(&id, identity, &e);
                        }
                    }
                }
            }
            DispatchOutcome::StartFailed(e) => {
                let attempts = task.dispatch_failures() + 1;
                let event = TaskEvent::DispatchFailed {
                    attempts,
                    max_attempts,
                    reason: e.to_string(),
                };
                report.dispatch_failures += 1;
                match task.apply(&event, now) {
                    Ok(_) if task.status() == TaskStatus::NeedsReview => warn!(
                        task = identity,
                        attempts,
                        "Session failed to start repeatedly, needs review: {}",
                        e
                    ),
                    Ok(_) => warn!(
                        task = identity,
                        attempts,
                        max_attempts,
                        "Session failed to start: {}",
                        e
                    ),
                    Err(err) => debug!(task = identity, "Dispatch failure not applied: {}", err),
                }
            }
        }
    }
}
