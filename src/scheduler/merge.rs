//! Diff and merge of fetched rows into the in-memory tasks.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{alert_stop_failure, CycleReport, Scheduler};
use crate::store::{FetchOutcome, TaskRow};
use crate::task::{Task, TaskEvent, TaskStatus, TransitionError};

impl Scheduler {
    pub(super) async fn merge(&mut self, fetched: &FetchOutcome, report: &mut CycleReport) {
        for row in &fetched.rows {
            if self.tasks.contains_key(&row.identity) {
                self.merge_row(row, report).await;
            } else {
                self.adopt_row(row, report);
            }
        }
    }

    /// First sighting of a row, at startup or after a human added it.
    fn adopt_row(&mut self, row: &TaskRow, report: &mut CycleReport) {
        let now = Utc::now();
        let mut task = Task::from_row(row, now);

        if task.status() == TaskStatus::InProgress {
            // Sessions do not survive a controller restart.
            let lost = TaskEvent::SessionLost {
                reason: "no live session for this task after controller restart".to_string(),
            };
            if task.apply(&lost, now).is_ok() {
                info!(task = task.identity(), "Recovered InProgress task, re-queued");
                report.sessions_lost += 1;
            }
        }

        debug!(task = task.identity(), status = %task.status(), priority = task.priority(), "Task discovered");
        report.created += 1;
        self.tasks.insert(task.identity().to_string(), task);
    }

    async fn merge_row(&mut self, row: &TaskRow, report: &mut CycleReport) {
        let Some(task) = self.tasks.get(&row.identity) else {
            return;
        };
        if task.last_observed_revision() == Some(row.revision.as_str()) {
            return;
        }

        let external = row.parsed_status();
        if external == TaskStatus::Blocked && task.status() != TaskStatus::Blocked {
            self.block(row, report).await;
            return;
        }

        let now = Utc::now();
        let Some(task) = self.tasks.get_mut(&row.identity) else {
            return;
        };

        if task.pending_write() {
            warn!(
                task = task.identity(),
                local = %task.status(),
                external = %external,
                "Row changed while a local update is pending, keeping local state"
            );
            report.conflicts += 1;
            task.observe_revision(row.revision.clone());
            return;
        }

        report.external_changes += 1;
        task.absorb_row_metadata(row);
        if row.next_action != task.next_action() {
            if task.assigned_agent().is_some() {
                // The running agent was started with the local text.
                debug!(
                    task = task.identity(),
                    "Next action edited while a session runs, re-asserting local text"
                );
                task.mark_pending_write();
            } else {
                debug!(task = task.identity(), "Next action edited externally");
                task.set_next_action(row.next_action.clone());
            }
        }

        let approved = row.plan_approved || external == TaskStatus::InProgress;
        let event = if task.status() == TaskStatus::AwaitingPlanApproval && approved {
            Some(TaskEvent::PlanApproved)
        } else if task.status() == TaskStatus::Blocked && external != TaskStatus::Blocked {
            Some(TaskEvent::ExternalUnblocked)
        } else if external != task.status() {
            Some(TaskEvent::ExternalOverride { status: external })
        } else {
            None
        };

        if let Some(event) = event {
            match task.apply(&event, now) {
                Ok(previous) => info!(
                    task = task.identity(),
                    from = %previous,
                    to = %task.status(),
                    event = event.label(),
                    "Applied external change"
                ),
                Err(TransitionError::LocalAuthority) => {
                    debug!(
                        task = task.identity(),
                        external = %external,
                        "Task is bound to a running session, re-asserting local status"
                    );
                    task.mark_pending_write();
                }
                Err(e) => {
                    warn!(
                        task = task.identity(),
                        external = %external,
                        "Rejected external status: {}",
                        e
                    );
                    task.mark_pending_write();
                }
            }
        }

        task.observe_revision(row.revision.clone());
    }

    /// External Blocked wins over everything, running sessions included.
    async fn block(&mut self, row: &TaskRow, report: &mut CycleReport) {
        let bound = self
            .tasks
            .get(&row.identity)
            .and_then(|t| t.assigned_agent().cloned());
        if let Some(id) = bound {
            match self.sessions.stop(&id).await {
                Ok(()) => info!(task = %row.identity, session = %id, "Stopped session of blocked task"),
                Err(e) => alert_stop_failure(&id, &row.identity, &e),
            }
        }

        let Some(task) = self.tasks.get_mut(&row.identity) else {
            return;
        };
        let now = Utc::now();
        task.absorb_row_metadata(row);
        task.set_next_action(row.next_action.clone());
        if let Ok(previous) = task.apply(&TaskEvent::ExternalBlocked, now) {
            info!(task = task.identity(), from = %previous, "Task blocked externally");
            report.blocked += 1;
        }
        task.observe_revision(row.revision.clone());
    }

    /// Drop tasks whose rows are gone, stopping their sessions first.
    pub(super) async fn collect_garbage(&mut self, fetched: &FetchOutcome, report: &mut CycleReport) {
        let present = fetched.present_identities();
        let gone: Vec<String> = self
            .tasks
            .keys()
            .filter(|identity| !present.contains(identity.as_str()))
            .cloned()
            .collect();

        for identity in gone {
            let bound = self
                .tasks
                .get(&identity)
                .and_then(|t| t.assigned_agent().cloned());
            if let Some(id) = bound {
                if let Err(e) = self.sessions.stop(&id).await {
                    alert_stop_failure(&id, &identity, &e);
                }
            }
            self.tasks.remove(&identity);
            info!(task = %identity, "Task removed from record store, dropped");
            report.removed += 1;
        }
    }
}
