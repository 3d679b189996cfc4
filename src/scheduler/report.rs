//! Per-cycle summary.

use serde::Serialize;
use tracing::{debug, info};

/// What one cycle did. Logged at the end of every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// False when the change marker allowed reusing the previous state,
    /// or the fetch failed.
    pub fetched: bool,
    pub fetch_failed: bool,
    pub rows: usize,
    pub rejected_rows: usize,

    // merge
    pub created: usize,
    pub removed: usize,
    pub external_changes: usize,
    pub blocked: usize,
    pub conflicts: usize,
    pub requeued: usize,

    // dispatch
    pub plans_requested: usize,
    pub dispatched: usize,
    pub dispatch_failures: usize,

    // supervise
    pub completed: usize,
    pub needs_review: usize,
    pub incomplete: usize,
    pub interrupted: usize,
    pub restarted: usize,
    pub sessions_lost: usize,
    pub deferred: usize,

    // write-back
    pub written: usize,
    pub write_conflicts: usize,
    pub write_errors: usize,

    pub leaked_sessions: usize,
}

impl CycleReport {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            ..Self::default()
        }
    }

    /// Whether anything moved this cycle.
    pub fn is_quiet(&self) -> bool {
        !self.fetch_failed
            && self.created
                + self.removed
                + self.external_changes
                + self.blocked
                + self.conflicts
                + self.requeued
                + self.plans_requested
                + self.dispatched
                + self.dispatch_failures
                + self.completed
                + self.needs_review
                + self.incomplete
                + self.interrupted
                + self.restarted
                + self.sessions_lost
                + self.written
                + self.write_conflicts
                + self.write_errors
                == 0
    }

    pub fn log(&self) {
        if self.is_quiet() {
            debug!(cycle = self.cycle, rows = self.rows, "Cycle finished, nothing to do");
            return;
        }
        info!(
            cycle = self.cycle,
            fetched = self.fetched,
            fetch_failed = self.fetch_failed,
            rows = self.rows,
            rejected = self.rejected_rows,
            created = self.created,
            removed = self.removed,
            external = self.external_changes,
            blocked = self.blocked,
            conflicts = self.conflicts,
            requeued = self.requeued,
            plans = self.plans_requested,
            dispatched = self.dispatched,
            dispatch_failures = self.dispatch_failures,
            completed = self.completed,
            needs_review = self.needs_review,
            incomplete = self.incomplete,
            interrupted = self.interrupted,
            restarted = self.restarted,
            lost = self.sessions_lost,
            deferred = self.deferred,
            written = self.written,
            write_conflicts = self.write_conflicts,
            write_errors = self.write_errors,
            leaked = self.leaked_sessions,
            "Cycle finished"
        );
    }
}
