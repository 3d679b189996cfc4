use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::{OracleConfig, SchedulerConfig, SessionConfig};
use crate::oracle::prompts::{COMPLETION_HEADER, PLANNING_HEADER, STALL_HEADER};
use crate::session::IsolationHandle;
use crate::store::{InMemoryTaskStore, TaskRow};
use crate::testing::{FakeIsolation, ScriptedLlm};

const NO_PLAN: &str = r#"{"needs_planning": false, "complexity": "trivial", "rationale": "small change", "confidence": 0.9}"#;
const PLAN: &str = r#"{"needs_planning": true, "complexity": "complex", "rationale": "touches many modules", "confidence": 0.8}"#;
const DONE: &str = r#"{"actually_complete": true, "confidence": 0.9, "issues": [], "recommended_status": "completed", "rationale": "typo fixed"}"#;
const MISSING_TESTS: &str = r#"{"actually_complete": false, "confidence": 0.85, "issues": ["missing tests"], "rationale": "no tests added"}"#;
const UNSURE: &str = r#"{"actually_complete": true, "confidence": 0.4, "issues": [], "recommended_status": "completed", "rationale": "hard to tell"}"#;
const RESTART: &str = r#"{"status": "stuck", "recommendation": "restart", "confidence": 0.8, "rationale": "looping on the same error"}"#;
const INTERRUPT: &str = r#"{"status": "stuck", "recommendation": "interrupt", "suggested_message": "Run the tests", "confidence": 0.8, "rationale": "waiting"}"#;

/// Model that answers by question kind.
fn answering(plan: &'static str, completion: &'static str, stall: &'static str) -> ScriptedLlm {
    ScriptedLlm::new(move |prompt| {
        let answer = if prompt.starts_with(PLANNING_HEADER) {
            plan
        } else if prompt.starts_with(COMPLETION_HEADER) {
            completion
        } else if prompt.starts_with(STALL_HEADER) {
            stall
        } else {
            "{}"
        };
        Ok(answer.to_string())
    })
}

struct Harness {
    store: InMemoryTaskStore,
    llm: Arc<ScriptedLlm>,
    isolation: Arc<FakeIsolation>,
    sessions: Arc<SessionManager>,
    scheduler: Scheduler,
}

impl Harness {
    async fn new(rows: Vec<TaskRow>, llm: ScriptedLlm) -> Self {
        Self::with_config(rows, llm, SchedulerConfig::for_tests()).await
    }

    async fn with_config(rows: Vec<TaskRow>, llm: ScriptedLlm, config: SchedulerConfig) -> Self {
        let store = InMemoryTaskStore::with_rows(rows).await;
        let llm = Arc::new(llm);
        let isolation = Arc::new(FakeIsolation::new());
        let sessions = Arc::new(SessionManager::new(
            isolation.clone(),
            &SessionConfig::for_tests("/projects"),
        ));
        let oracle = Arc::new(DecisionOracle::new(llm.clone(), OracleConfig::for_tests()));
        let scheduler = Scheduler::new(
            Arc::new(store.clone()),
            oracle,
            Arc::clone(&sessions),
            config,
        );
        Self {
            store,
            llm,
            isolation,
            sessions,
            scheduler,
        }
    }

    async fn cycle(&mut self) -> CycleReport {
        let report = self.scheduler.run_cycle().await.unwrap();
        self.assert_binding_invariant().await;
        report
    }

    fn status(&self, identity: &str) -> TaskStatus {
        self.scheduler.task(identity).unwrap().status()
    }

    async fn stored_status(&self, identity: &str) -> TaskStatus {
        self.store.row(identity).await.unwrap().parsed_status()
    }

    fn handle(&self, identity: &str) -> IsolationHandle {
        self.isolation.handle_for(identity).unwrap()
    }

    fn in_progress(&self) -> usize {
        self.scheduler
            .tasks()
            .filter(|t| t.status() == TaskStatus::InProgress)
            .count()
    }

    /// InProgress if and only if a live session is bound.
    async fn assert_binding_invariant(&self) {
        for task in self.scheduler.tasks() {
            let bound_and_alive = match task.assigned_agent() {
                Some(id) => self.sessions.is_alive(id).await,
                None => false,
            };
            assert_eq!(
                task.status() == TaskStatus::InProgress,
                bound_and_alive,
                "task {} is {} with agent {:?}",
                task.identity(),
                task.status(),
                task.assigned_agent()
            );
        }
    }
}

fn pending(identity: &str, priority: i64, next_action: &str) -> TaskRow {
    TaskRow::new(identity, priority, Some("pending"), next_action)
}

#[tokio::test]
async fn pending_task_is_dispatched_with_its_next_action() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;

    let report = h.cycle().await;

    assert_eq!(report.dispatched, 1);
    assert_eq!(h.status("p1"), TaskStatus::InProgress);
    let created = h.isolation.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, std::path::PathBuf::from("/projects/p1"));
    assert!(created[0].1.contains("fix typo"));
    assert_eq!(h.stored_status("p1").await, TaskStatus::InProgress);
}

#[tokio::test]
async fn ended_session_with_confident_verdict_completes() {
    let mut h = Harness::new(
        vec![pending("p2", 2, "add endpoint")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;
    let handle = h.handle("p2");
    h.isolation.set_alive(&handle, false);

    let report = h.cycle().await;

    assert_eq!(report.completed, 1);
    let task = h.scheduler.task("p2").unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert!(task.assigned_agent().is_none());
    assert!(h.isolation.destroyed().contains(&handle));

    let row = h.store.row("p2").await.unwrap();
    assert_eq!(row.parsed_status(), TaskStatus::Completed);
    assert_eq!(row.assigned_agent, None);
}

#[tokio::test]
async fn incomplete_work_carries_issues_into_the_next_attempt() {
    let mut h = Harness::new(
        vec![pending("p2", 2, "add endpoint")],
        answering(NO_PLAN, MISSING_TESTS, RESTART),
    )
    .await;
    h.cycle().await;
    h.isolation.set_alive(&h.handle("p2"), false);

    let report = h.cycle().await;
    assert_eq!(report.incomplete, 1);
    assert_eq!(h.status("p2"), TaskStatus::Incomplete);
    assert!(h.scheduler.task("p2").unwrap().next_action().contains("missing tests"));
    let row = h.store.row("p2").await.unwrap();
    assert_eq!(row.parsed_status(), TaskStatus::Incomplete);
    assert!(row.next_action.contains("missing tests"));

    let report = h.cycle().await;
    assert_eq!(report.requeued, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.status("p2"), TaskStatus::InProgress);
    let created = h.isolation.created();
    assert_eq!(created.len(), 2);
    assert!(created[1].1.contains("missing tests"));
}

#[tokio::test]
async fn stalled_session_is_restarted_as_incomplete() {
    let config = SchedulerConfig {
        stall_threshold: Duration::from_secs(60 * 60),
        session_timeout: Duration::from_secs(3 * 60 * 60),
        ..SchedulerConfig::for_tests()
    };
    let mut h = Harness::with_config(
        vec![pending("p3", 1, "refactor parser")],
        answering(NO_PLAN, DONE, RESTART),
        config,
    )
    .await;
    h.cycle().await;
    let handle = h.handle("p3");
    h.isolation
        .push_output(&handle, ["compiling", "error[E0308]: mismatched types"]);
    h.isolation.set_idle(&handle, Duration::from_secs(70 * 60));

    let report = h.cycle().await;

    assert_eq!(report.restarted, 1);
    assert_eq!(h.status("p3"), TaskStatus::Incomplete);
    assert!(h.isolation.destroyed().contains(&handle));
    let task = h.scheduler.task("p3").unwrap();
    assert!(task.review_reason().unwrap().contains("looping"));
    let stall_prompt = h
        .llm
        .prompts()
        .into_iter()
        .find(|p| p.starts_with(STALL_HEADER))
        .unwrap();
    assert!(stall_prompt.contains("mismatched types"));
}

#[tokio::test]
async fn stall_interrupt_sends_guidance_once_per_threshold() {
    let config = SchedulerConfig {
        stall_threshold: Duration::from_secs(10 * 60),
        ..SchedulerConfig::for_tests()
    };
    let mut h = Harness::with_config(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, INTERRUPT),
        config,
    )
    .await;
    h.cycle().await;
    let handle = h.handle("p1");
    h.isolation.set_idle(&handle, Duration::from_secs(20 * 60));

    let report = h.cycle().await;
    assert_eq!(report.interrupted, 1);
    assert_eq!(h.status("p1"), TaskStatus::InProgress);
    assert_eq!(h.isolation.sent(), vec![(handle.clone(), "Run the tests".to_string())]);

    h.cycle().await;
    assert_eq!(h.isolation.sent().len(), 1);
}

#[tokio::test]
async fn external_block_stops_the_running_session() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;
    let handle = h.handle("p1");
    h.store
        .edit("p1", |row| row.status = Some("Blocked".to_string()))
        .await;

    let report = h.cycle().await;

    assert_eq!(report.blocked, 1);
    assert_eq!(h.status("p1"), TaskStatus::Blocked);
    assert!(h.scheduler.task("p1").unwrap().assigned_agent().is_none());
    assert!(h.isolation.destroyed().contains(&handle));
    assert_eq!(h.sessions.active_count().await, 0);
    assert_eq!(h.stored_status("p1").await, TaskStatus::Blocked);

    h.store
        .edit("p1", |row| row.status = Some("pending".to_string()))
        .await;
    h.cycle().await;
    assert_eq!(h.status("p1"), TaskStatus::InProgress);
}

#[tokio::test]
async fn never_more_sessions_than_the_limit() {
    let rows = (1..=5)
        .map(|i| pending(&format!("p{}", i), i, "work"))
        .collect();
    let mut h = Harness::new(rows, answering(NO_PLAN, DONE, RESTART)).await;

    h.cycle().await;
    assert_eq!(h.in_progress(), 2);
    assert_eq!(h.isolation.running(), 2);
    assert_eq!(h.status("p1"), TaskStatus::InProgress);
    assert_eq!(h.status("p2"), TaskStatus::InProgress);
    assert_eq!(h.status("p3"), TaskStatus::Pending);

    h.isolation.set_alive(&h.handle("p1"), false);
    h.cycle().await;
    assert!(h.in_progress() <= 2);
    assert_eq!(h.status("p1"), TaskStatus::Completed);

    h.cycle().await;
    assert_eq!(h.in_progress(), 2);
    assert_eq!(h.status("p3"), TaskStatus::InProgress);
}

#[tokio::test]
async fn unavailable_oracle_leaves_tasks_awaiting_plan_approval() {
    let rows = (1..=3)
        .map(|i| pending(&format!("p{}", i), i, "work"))
        .collect();
    let mut h = Harness::new(rows, ScriptedLlm::unavailable()).await;

    let report = h.cycle().await;

    assert_eq!(report.plans_requested, 3);
    assert_eq!(report.dispatched, 0);
    assert!(h.isolation.created().is_empty());
    for identity in ["p1", "p2", "p3"] {
        assert_eq!(h.status(identity), TaskStatus::AwaitingPlanApproval);
        assert_eq!(
            h.stored_status(identity).await,
            TaskStatus::AwaitingPlanApproval
        );
    }
}

#[tokio::test]
async fn approved_plan_is_dispatched_without_asking_again() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "rewrite storage layer")],
        answering(PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;
    assert_eq!(h.status("p1"), TaskStatus::AwaitingPlanApproval);

    h.cycle().await;
    assert_eq!(h.status("p1"), TaskStatus::AwaitingPlanApproval);

    h.store.edit("p1", |row| row.plan_approved = true).await;
    let report = h.cycle().await;

    assert_eq!(report.dispatched, 1);
    assert_eq!(h.status("p1"), TaskStatus::InProgress);
    let planning_calls = h
        .llm
        .prompts()
        .iter()
        .filter(|p| p.starts_with(PLANNING_HEADER))
        .count();
    assert_eq!(planning_calls, 1);
}

#[tokio::test]
async fn status_set_to_in_progress_counts_as_approval() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "rewrite storage layer")],
        answering(PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;

    h.store
        .edit("p1", |row| row.status = Some("In Progress".to_string()))
        .await;
    h.cycle().await;

    assert_eq!(h.status("p1"), TaskStatus::InProgress);
    assert_eq!(h.isolation.created().len(), 1);
}

#[tokio::test]
async fn low_confidence_goes_to_review_and_stays_there() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, UNSURE, RESTART),
    )
    .await;
    h.cycle().await;
    h.isolation.set_alive(&h.handle("p1"), false);

    let report = h.cycle().await;
    assert_eq!(report.needs_review, 1);
    assert_eq!(h.status("p1"), TaskStatus::NeedsReview);
    let row = h.store.row("p1").await.unwrap();
    assert!(row.note.unwrap().contains("low confidence"));

    h.cycle().await;
    assert_eq!(h.status("p1"), TaskStatus::NeedsReview);
    assert_eq!(h.isolation.created().len(), 1);

    h.store
        .edit("p1", |row| row.status = Some("pending".to_string()))
        .await;
    h.cycle().await;
    assert_eq!(h.status("p1"), TaskStatus::InProgress);
    assert_eq!(h.isolation.created().len(), 2);
}

#[tokio::test]
async fn human_status_edit_is_ignored_while_a_session_runs() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;
    h.store
        .edit("p1", |row| row.status = Some("completed".to_string()))
        .await;

    h.cycle().await;

    assert_eq!(h.status("p1"), TaskStatus::InProgress);
    assert_eq!(h.stored_status("p1").await, TaskStatus::InProgress);
}

#[tokio::test]
async fn human_next_action_edit_is_ignored_while_a_session_runs() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;
    h.store
        .edit("p1", |row| row.next_action = "delete the repo".to_string())
        .await;

    h.cycle().await;

    assert_eq!(h.status("p1"), TaskStatus::InProgress);
    assert_eq!(h.scheduler.task("p1").unwrap().next_action(), "fix typo");
    assert_eq!(h.store.row("p1").await.unwrap().next_action, "fix typo");

    h.isolation.set_alive(&h.handle("p1"), false);
    h.cycle().await;
    let completion_prompt = h
        .llm
        .prompts()
        .into_iter()
        .find(|p| p.starts_with(COMPLETION_HEADER))
        .unwrap();
    assert!(completion_prompt.contains("fix typo"));
    assert!(!completion_prompt.contains("delete the repo"));
}

#[tokio::test]
async fn repeated_start_failures_escalate_to_review() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    h.isolation.fail_creates(3);

    let first = h.cycle().await;
    assert_eq!(first.dispatch_failures, 1);
    assert_eq!(h.status("p1"), TaskStatus::Pending);
    assert_eq!(h.scheduler.task("p1").unwrap().dispatch_failures(), 1);

    h.cycle().await;
    assert_eq!(h.status("p1"), TaskStatus::Pending);

    h.cycle().await;
    assert_eq!(h.status("p1"), TaskStatus::NeedsReview);
    let row = h.store.row("p1").await.unwrap();
    assert_eq!(row.parsed_status(), TaskStatus::NeedsReview);
    assert!(row.note.unwrap().contains("failed to start 3 times"));
}

#[tokio::test]
async fn in_progress_rows_are_redispatched_after_restart() {
    let mut row = TaskRow::new("p2", 2, Some("in_progress"), "add endpoint");
    row.assigned_agent = Some("s1".to_string());
    let mut h = Harness::new(vec![row], answering(NO_PLAN, DONE, RESTART)).await;

    let report = h.cycle().await;

    assert_eq!(report.sessions_lost, 1);
    assert_eq!(report.dispatched, 1);
    let task = h.scheduler.task("p2").unwrap();
    assert_eq!(task.status(), TaskStatus::InProgress);
    assert_ne!(task.assigned_agent().unwrap().as_str(), "s1");
}

#[tokio::test]
async fn write_back_round_trips_through_fetch() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;

    let fetched = h.store.fetch_all().await.unwrap();
    let row = &fetched.rows[0];
    let task = h.scheduler.task("p1").unwrap();
    assert_eq!(row.parsed_status(), task.status());
    assert_eq!(row.next_action, task.next_action());
    assert_eq!(
        row.assigned_agent.as_deref(),
        task.assigned_agent().map(|id| id.as_str())
    );
    assert_eq!(Some(row.revision.as_str()), task.last_observed_revision());
    assert!(!task.pending_write());

    let writes = h.store.write_count();
    let report = h.cycle().await;
    assert_eq!(report.external_changes, 0);
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn removed_rows_drop_tasks_but_malformed_rows_keep_them() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo"), pending("p2", 2, "add endpoint")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;
    let handle = h.handle("p1");

    h.store.remove("p1").await;
    h.store.remove("p2").await;
    h.store
        .insert_malformed(Some("p2"), "priority is not a number")
        .await;
    let report = h.cycle().await;

    assert_eq!(report.removed, 1);
    assert_eq!(report.rejected_rows, 1);
    assert!(h.scheduler.task("p1").is_none());
    assert!(h.isolation.destroyed().contains(&handle));
    assert!(h.scheduler.task("p2").is_some());
}

#[tokio::test]
async fn local_change_wins_over_concurrent_edit() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;

    h.store.set_unreachable(true);
    h.isolation.set_alive(&h.handle("p1"), false);
    let offline = h.cycle().await;
    assert!(offline.fetch_failed);
    assert_eq!(offline.write_errors, 1);
    assert_eq!(h.status("p1"), TaskStatus::Completed);
    assert!(h.scheduler.task("p1").unwrap().pending_write());

    h.store.set_unreachable(false);
    h.store
        .edit("p1", |row| row.next_action = "fix typo in README".to_string())
        .await;
    let report = h.cycle().await;

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.written, 1);
    assert_eq!(h.stored_status("p1").await, TaskStatus::Completed);
}

#[tokio::test]
async fn fetch_failures_become_fatal_after_the_bound() {
    let config = SchedulerConfig {
        max_consecutive_fetch_failures: 2,
        ..SchedulerConfig::for_tests()
    };
    let mut h = Harness::with_config(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
        config,
    )
    .await;
    h.store.set_unreachable(true);

    assert!(h.scheduler.run_cycle().await.unwrap().fetch_failed);
    let err = h.scheduler.run_cycle().await.unwrap_err();
    assert!(matches!(err, ControllerError::FetchExhausted { cycles: 2, .. }));
}

#[tokio::test]
async fn unchanged_store_skips_the_fetch() {
    let mut h = Harness::new(
        vec![TaskRow::new("p1", 1, Some("completed"), "done already")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;

    assert!(h.cycle().await.fetched);
    assert!(!h.cycle().await.fetched);

    h.store
        .edit("p1", |row| row.status = Some("pending".to_string()))
        .await;
    let report = h.cycle().await;
    assert!(report.fetched);
    assert_eq!(h.status("p1"), TaskStatus::InProgress);
}

#[tokio::test]
async fn session_timeout_stops_and_verifies() {
    let config = SchedulerConfig {
        session_timeout: Duration::from_millis(1),
        ..SchedulerConfig::for_tests()
    };
    let mut h = Harness::with_config(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
        config,
    )
    .await;
    h.cycle().await;
    let handle = h.isolation.handles()[0].clone();
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.cycle().await;

    assert_eq!(h.status("p1"), TaskStatus::Completed);
    assert!(h.isolation.destroyed().contains(&handle));
}

#[tokio::test]
async fn slow_verification_still_settles_the_ended_session() {
    let config = SchedulerConfig {
        cycle_soft_deadline: Duration::from_millis(20),
        ..SchedulerConfig::for_tests()
    };
    let mut h = Harness::with_config(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART).with_delay(Duration::from_millis(300)),
        config,
    )
    .await;
    h.cycle().await;
    let handle = h.handle("p1");
    h.isolation.set_alive(&handle, false);

    let report = h.cycle().await;

    assert_eq!(report.deferred, 0);
    assert_eq!(report.completed, 1);
    assert_eq!(h.status("p1"), TaskStatus::Completed);
    assert!(h.isolation.destroyed().contains(&handle));

    let report = h.cycle().await;
    assert_eq!(report.sessions_lost, 0);
    assert_eq!(report.dispatched, 0);
    assert_eq!(h.isolation.created().len(), 1);
}

#[tokio::test]
async fn slow_stall_check_is_deferred_without_touching_the_session() {
    let config = SchedulerConfig {
        cycle_soft_deadline: Duration::from_millis(20),
        stall_threshold: Duration::from_secs(10 * 60),
        ..SchedulerConfig::for_tests()
    };
    let mut h = Harness::with_config(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART).with_delay(Duration::from_millis(300)),
        config,
    )
    .await;
    h.cycle().await;
    let handle = h.handle("p1");
    h.isolation.set_idle(&handle, Duration::from_secs(20 * 60));

    let report = h.cycle().await;

    assert_eq!(report.deferred, 1);
    assert_eq!(report.restarted, 0);
    assert_eq!(h.status("p1"), TaskStatus::InProgress);
    assert!(h.isolation.destroyed().is_empty());
}

#[tokio::test]
async fn shutdown_stops_sessions_and_requeues_tasks() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo"), pending("p2", 2, "add endpoint")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    h.scheduler.run(cancel).await.unwrap();

    assert_eq!(h.isolation.created().len(), 2);
    assert_eq!(h.isolation.running(), 0);
    assert_eq!(h.sessions.active_count().await, 0);
    for identity in ["p1", "p2"] {
        assert_eq!(h.status(identity), TaskStatus::Pending);
        assert_eq!(h.stored_status(identity).await, TaskStatus::Pending);
    }
}

#[tokio::test]
async fn leaked_sessions_are_alerted_and_retried() {
    let mut h = Harness::new(
        vec![pending("p1", 1, "fix typo")],
        answering(NO_PLAN, DONE, RESTART),
    )
    .await;
    h.cycle().await;
    h.isolation.fail_destroy(true);
    h.store
        .edit("p1", |row| row.status = Some("blocked".to_string()))
        .await;

    h.cycle().await;
    assert_eq!(h.status("p1"), TaskStatus::Blocked);
    assert_eq!(h.sessions.active_count().await, 1);

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.leaked_sessions, 1);

    h.isolation.fail_destroy(false);
    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.leaked_sessions, 0);
    assert_eq!(h.sessions.active_count().await, 0);
}
