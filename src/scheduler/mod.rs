//! Reconciliation loop.
//!
//! Every cycle: fetch the task table, merge it into the in-memory tasks,
//! drop tasks that disappeared, requeue incomplete work, dispatch sessions
//! into free slots (asking the oracle about plans first), supervise running
//! sessions, and write changed status back to the record store.
//!
//! The task map is only mutated in the serial apply phases. Dispatch and
//! supervise work for many tasks runs concurrently against cloned task
//! snapshots and comes back as outcomes.

mod dispatch;
mod merge;
mod report;
mod supervise;
#[cfg(test)]
mod tests;

pub use report::CycleReport;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, SchedulerConfig};
use crate::oracle::DecisionOracle;
use crate::session::{SessionError, SessionId, SessionManager};
use crate::store::{FetchOutcome, RecordStore, StoreError, UpdateOutcome};
use crate::task::{Task, TaskEvent, TaskStatus};

/// Conditions that stop the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("record store fetch failed {cycles} cycles in a row: {last_error}")]
    FetchExhausted { cycles: u32, last_error: String },
}

pub struct Scheduler {
    store: Arc<dyn RecordStore>,
    oracle: Arc<DecisionOracle>,
    sessions: Arc<SessionManager>,
    config: SchedulerConfig,
    tasks: HashMap<String, Task>,
    cycle: u64,
    last_change_marker: Option<String>,
    consecutive_fetch_failures: u32,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        oracle: Arc<DecisionOracle>,
        sessions: Arc<SessionManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            sessions,
            config,
            tasks: HashMap::new(),
            cycle: 0,
            last_change_marker: None,
            consecutive_fetch_failures: 0,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn task(&self, identity: &str) -> Option<&Task> {
        self.tasks.get(identity)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Run cycles every `poll_interval` until `cancel` fires, then shut down.
    ///
    /// A cycle in progress when the token fires runs to completion without
    /// dispatching anything new.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ControllerError> {
        self.shutdown = cancel.clone();
        info!(
            poll_interval = ?self.config.poll_interval,
            max_sessions = self.config.max_concurrent_sessions,
            oracle = self.oracle.is_enabled(),
            backend = self.store.backend_name(),
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = interval.tick() => {}
            }
            match self.run_cycle().await {
                Ok(report) => report.log(),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            error!(alert = true, "Controller stopping: {}", e);
        }
        self.shutdown().await;
        result
    }

    /// One reconciliation pass.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, ControllerError> {
        self.cycle += 1;
        let mut report = CycleReport::new(self.cycle);

        self.retry_leaked_sessions(&mut report).await;

        match self.fetch(&mut report).await? {
            Some(fetched) => {
                self.merge(&fetched, &mut report).await;
                self.collect_garbage(&fetched, &mut report).await;
            }
            None if !report.fetch_failed => {
                debug!(cycle = self.cycle, "Record store unchanged");
            }
            None => {}
        }

        self.requeue(&mut report);

        if self.shutdown.is_cancelled() {
            debug!("Shutdown requested, skipping dispatch");
        } else {
            self.dispatch(&mut report).await;
        }

        self.supervise(&mut report).await;
        self.write_back(&mut report).await;

        Ok(report)
    }

    /// Full fetch unless the change marker says nothing moved.
    ///
    /// `Ok(None)` means reuse the current state: either unchanged, or the
    /// fetch failed and the failure bound was not reached yet.
    async fn fetch(
        &mut self,
        report: &mut CycleReport,
    ) -> Result<Option<FetchOutcome>, ControllerError> {
        let forced = (self.cycle - 1) % u64::from(self.config.full_fetch_every) == 0;

        let marker = match self.store.change_marker().await {
            Ok(marker) => marker,
            Err(e) => {
                debug!("Change marker unavailable: {}", e);
                None
            }
        };
        if !forced && marker.is_some() && marker == self.last_change_marker {
            return Ok(None);
        }

        match self.store.fetch_all().await {
            Ok(fetched) => {
                self.consecutive_fetch_failures = 0;
                self.last_change_marker = marker;
                report.fetched = true;
                report.rows = fetched.rows.len();
                report.rejected_rows = fetched.rejected.len();
                for rejected in &fetched.rejected {
                    warn!(
                        task = rejected.identity.as_deref().unwrap_or("<unknown>"),
                        "Skipping malformed row: {}",
                        rejected.reason
                    );
                }
                Ok(Some(fetched))
            }
            Err(e) => {
                self.consecutive_fetch_failures += 1;
                self.last_change_marker = None;
                report.fetch_failed = true;
                warn!(
                    failures = self.consecutive_fetch_failures,
                    max = self.config.max_consecutive_fetch_failures,
                    "Record store fetch failed: {}",
                    e
                );
                if self.consecutive_fetch_failures >= self.config.max_consecutive_fetch_failures {
                    return Err(ControllerError::FetchExhausted {
                        cycles: self.consecutive_fetch_failures,
                        last_error: e.to_string(),
                    });
                }
                Ok(None)
            }
        }
    }

    /// Incomplete tasks go back into the queue.
    fn requeue(&mut self, report: &mut CycleReport) {
        let now = Utc::now();
        for task in self.tasks.values_mut() {
            if task.status() == TaskStatus::Incomplete
                && task.apply(&TaskEvent::Requeue, now).is_ok()
            {
                debug!(task = task.identity(), "Requeued");
                report.requeued += 1;
            }
        }
    }

    /// Persist every task with a pending local change.
    async fn write_back(&mut self, report: &mut CycleReport) {
        let mut pending: Vec<&mut Task> = self
            .tasks
            .values_mut()
            .filter(|t| t.pending_write())
            .collect();
        pending.sort_by(|a, b| a.identity().cmp(b.identity()));

        let mut store_changed = false;
        for task in pending {
            let fields = task.status_fields();
            let expected = task.last_observed_revision().unwrap_or_default().to_string();
            match self.store.update(task.identity(), &fields, &expected).await {
                Ok(UpdateOutcome::Applied { revision }) => {
                    debug!(task = task.identity(), status = %fields.status, "Status written");
                    task.mark_written(revision);
                    report.written += 1;
                    store_changed = true;
                }
                Ok(UpdateOutcome::Conflict { current_revision }) => {
                    warn!(
                        task = task.identity(),
                        expected = %expected,
                        current = current_revision.as_deref().unwrap_or("<missing>"),
                        "Write conflict, keeping local state for the next cycle"
                    );
                    report.write_conflicts += 1;
                    store_changed = true;
                }
                Err(e) => {
                    warn!(task = task.identity(), "Write-back failed, will retry: {}", e);
                    report.write_errors += 1;
                }
            }
        }

        if store_changed {
            self.last_change_marker = None;
        }
    }

    async fn retry_leaked_sessions(&self, report: &mut CycleReport) {
        let failures = self.sessions.retry_leaked().await;
        report.leaked_sessions = failures.len();
        for (id, e) in failures {
            alert_stop_failure(&id, "<leaked>", &e);
        }
    }

    /// Stop every session and hand its task back to the queue.
    async fn shutdown(&mut self) {
        info!("Scheduler shutting down");
        let now = Utc::now();

        let bound: Vec<(String, SessionId)> = self
            .tasks
            .values()
            .filter_map(|t| t.assigned_agent().map(|id| (t.identity().to_string(), id.clone())))
            .collect();

        for (identity, id) in bound {
            if let Err(e) = self.sessions.stop(&id).await {
                alert_stop_failure(&id, &identity, &e);
            }
            if let Some(task) = self.tasks.get_mut(&identity) {
                let lost = TaskEvent::SessionLost {
                    reason: "controller shut down".to_string(),
                };
                if let Err(e) = task.apply(&lost, now) {
                    warn!(task = %identity, "Could not release task: {}", e);
                }
            }
        }

        for (id, e) in self.sessions.stop_all().await {
            alert_stop_failure(&id, "<untracked>", &e);
        }

        let mut report = CycleReport::new(self.cycle);
        self.write_back(&mut report).await;
        info!(
            written = report.written,
            failed = report.write_conflicts + report.write_errors,
            "Scheduler stopped"
        );
    }
}

/// A session that could not be stopped may still be running unattended.
fn alert_stop_failure(id: &SessionId, identity: &str, e: &SessionError) {
    error!(
        alert = true,
        session = %id,
        task = identity,
        "Failed to stop agent session, it may still be running: {}",
        e
    );
}
