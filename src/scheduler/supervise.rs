//! Supervision of running sessions: completion, timeout and stalls.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{alert_stop_failure, CycleReport, Scheduler};
use crate::config::SchedulerConfig;
use crate::oracle::{interrupt_message, DecisionOracle, StallRecommendation};
use crate::session::{evidence, SessionError, SessionId, SessionManager, SessionSnapshot};
use crate::task::{CompletionOutcome, Task, TaskEvent, TaskStatus};

enum SuperviseOutcome {
    Healthy,
    Lost { reason: String },
    Ended { outcome: CompletionOutcome },
    StallChecked,
    Interrupted,
    Restarted { rationale: String },
    /// Not observed before the cycle deadline; the session is untouched.
    Deferred,
}

/// What observation decided. Anything that stops a session is carried
/// out after the deadline-bound phase so a stopped session is never
/// left without an outcome.
enum Observation {
    Settled(SuperviseOutcome),
    /// Ended or overran: stop it, then verify the work.
    Finish(SessionSnapshot),
    /// Stop the session, then apply the outcome.
    Stop {
        session: SessionId,
        then: SuperviseOutcome,
    },
}

struct Supervisor<'a> {
    oracle: &'a DecisionOracle,
    sessions: &'a SessionManager,
    config: &'a SchedulerConfig,
    now: DateTime<Utc>,
}

impl Supervisor<'_> {
    async fn observe(&self, task: &Task) -> Observation {
        let Some(id) = task.assigned_agent() else {
            return Observation::Settled(SuperviseOutcome::Lost {
                reason: "no session bound to an InProgress task".to_string(),
            });
        };

        let snapshot = match self.sessions.snapshot(id).await {
            Ok(snapshot) => snapshot,
            Err(SessionError::NotFound(_)) => {
                return Observation::Settled(SuperviseOutcome::Lost {
                    reason: format!("session {} is no longer tracked", id),
                });
            }
            Err(e) => {
                warn!(task = task.identity(), session = %id, "Session poll failed: {}", e);
                return Observation::Stop {
                    session: id.clone(),
                    then: SuperviseOutcome::Lost {
                        reason: format!("session could not be observed: {}", e),
                    },
                };
            }
        };

        if !snapshot.alive {
            info!(task = task.identity(), session = %id, "Session ended");
            return Observation::Finish(snapshot);
        }

        if snapshot.elapsed > self.config.session_timeout {
            warn!(
                task = task.identity(),
                session = %id,
                elapsed = ?snapshot.elapsed,
                "Session exceeded its maximum runtime, stopping"
            );
            return Observation::Finish(snapshot);
        }

        if snapshot.idle > self.config.stall_threshold && self.stall_check_due(task) {
            return self.handle_stall(task, &snapshot).await;
        }

        Observation::Settled(SuperviseOutcome::Healthy)
    }

    fn stall_check_due(&self, task: &Task) -> bool {
        match task.last_stall_check_at() {
            None => true,
            Some(at) => (self.now - at)
                .to_std()
                .map(|since| since >= self.config.stall_threshold)
                .unwrap_or(false),
        }
    }

    async fn handle_stall(&self, task: &Task, snapshot: &SessionSnapshot) -> Observation {
        info!(
            task = task.identity(),
            session = %snapshot.session_id,
            idle = ?snapshot.idle,
            "Session idle past the stall threshold"
        );
        let verdict = self
            .oracle
            .assess_stall(task, snapshot.elapsed, snapshot.idle, &snapshot.tail)
            .await;

        let outcome = match verdict.recommendation {
            StallRecommendation::Continue => SuperviseOutcome::StallChecked,
            StallRecommendation::Interrupt => {
                match self
                    .sessions
                    .send_message(&snapshot.session_id, interrupt_message(&verdict))
                    .await
                {
                    Ok(()) => SuperviseOutcome::Interrupted,
                    Err(e) => {
                        warn!(task = task.identity(), "Could not send guidance: {}", e);
                        SuperviseOutcome::StallChecked
                    }
                }
            }
            StallRecommendation::Restart => {
                return Observation::Stop {
                    session: snapshot.session_id.clone(),
                    then: SuperviseOutcome::Restarted {
                        rationale: verdict.rationale,
                    },
                };
            }
        };
        Observation::Settled(outcome)
    }

    /// Carry out stops and completion checks. Not bound by the cycle
    /// deadline: stops are bounded by the isolation's grace period and
    /// verification by the oracle's own timeouts.
    async fn settle(&self, task: &Task, observation: Observation) -> SuperviseOutcome {
        match observation {
            Observation::Settled(outcome) => outcome,
            Observation::Stop { session, then } => {
                if let Err(e) = self.sessions.stop(&session).await {
                    alert_stop_failure(&session, task.identity(), &e);
                }
                then
            }
            Observation::Finish(snapshot) => SuperviseOutcome::Ended {
                outcome: self.finish(task, &snapshot).await,
            },
        }
    }

    /// Release the session and judge what it left behind.
    async fn finish(&self, task: &Task, snapshot: &SessionSnapshot) -> CompletionOutcome {
        if let Err(e) = self.sessions.stop(&snapshot.session_id).await {
            alert_stop_failure(&snapshot.session_id, task.identity(), &e);
        }
        let evidence = evidence::collect(&snapshot.working_dir, &snapshot.tail).await;
        let verdict = self.oracle.verify_completion(task, &evidence).await;
        self.oracle.completion_outcome(&verdict)
    }
}

impl Scheduler {
    /// Check every InProgress task concurrently.
    ///
    /// Observation (snapshot and stall verdicts) is bounded by the cycle
    /// soft deadline and deferred when it runs over. Once a session is to
    /// be stopped the task always receives its outcome this cycle.
    pub(super) async fn supervise(&mut self, report: &mut CycleReport) {
        let running: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.status() == TaskStatus::InProgress)
            .cloned()
            .collect();
        if running.is_empty() {
            return;
        }

        let supervisor = &Supervisor {
            oracle: self.oracle.as_ref(),
            sessions: self.sessions.as_ref(),
            config: &self.config,
            now: Utc::now(),
        };
        let deadline = tokio::time::Instant::now() + self.config.cycle_soft_deadline;
        let outcomes = join_all(running.iter().map(|task| async move {
            let observation = tokio::time::timeout_at(deadline, supervisor.observe(task))
                .await
                .unwrap_or(Observation::Settled(SuperviseOutcome::Deferred));
            supervisor.settle(task, observation).await
        }))
        .await;

        for (task, outcome) in running.iter().zip(outcomes) {
            self.apply_supervision(task.identity(), outcome, report);
        }
    }

    fn apply_supervision(
        &mut self,
        identity: &str,
        outcome: SuperviseOutcome,
        report: &mut CycleReport,
    ) {
        let now = Utc::now();
        let Some(task) = self.tasks.get_mut(identity) else {
            return;
        };

        let event = match outcome {
            SuperviseOutcome::Healthy => return,
            SuperviseOutcome::Deferred => {
                debug!(task = identity, "Supervision deferred to the next cycle");
                report.deferred += 1;
                return;
            }
            SuperviseOutcome::StallChecked => {
                task.mark_stall_checked(now);
                return;
            }
            SuperviseOutcome::Lost { reason } => {
                report.sessions_lost += 1;
                TaskEvent::SessionLost { reason }
            }
            SuperviseOutcome::Ended { outcome } => {
                match &outcome {
                    CompletionOutcome::Completed => report.completed += 1,
                    CompletionOutcome::NeedsReview { .. } => report.needs_review += 1,
                    CompletionOutcome::Incomplete { .. } => report.incomplete += 1,
                }
                TaskEvent::SessionEnded { outcome }
            }
            SuperviseOutcome::Interrupted => {
                report.interrupted += 1;
                TaskEvent::StallInterrupted
            }
            SuperviseOutcome::Restarted { rationale } => {
                report.restarted += 1;
                TaskEvent::StallRestarted { rationale }
            }
        };

        match task.apply(&event, now) {
            Ok(previous) if previous != task.status() => info!(
                task = identity,
                from = %previous,
                to = %task.status(),
                event = event.label(),
                "Task transitioned"
            ),
            Ok(_) => debug!(task = identity, event = event.label(), "Task updated"),
            Err(e) => warn!(task = identity, event = event.label(), "Transition rejected: {}", e),
        }
    }
}
