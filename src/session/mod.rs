//! Agent session manager.
//!
//! Owns every running agent session. A session is bound to exactly one task
//! and lives until it ends, is stopped, or the controller shuts down. The
//! scheduler only ever holds the `SessionId`.
//!
//! Isolation is pluggable (`Isolation`); the manager adds task binding, idle
//! tracking and the output tail on top of it.

pub mod evidence;
pub mod isolation;
pub mod process;
mod tail;

pub use evidence::Evidence;
pub use isolation::{Isolation, IsolationHandle, PollReport};
pub use process::ProcessIsolation;
pub use tail::OutputTail;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::task::Task;

/// Identifier of an agent session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("failed to start session: {0}")]
    StartFailed(String),

    #[error("failed to stop session: {0}")]
    StopFailed(String),

    #[error("failed to send message: {0}")]
    SendFailed(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("failed to poll session: {0}")]
    Poll(String),
}

/// A running execution bound to one task.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub id: SessionId,
    pub task_identity: String,
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub output_tail: OutputTail,
    /// A stop was attempted and failed; the process may still be running.
    pub leaked: bool,
    handle: IsolationHandle,
    seen_lines: u64,
}

/// Everything the scheduler needs from one poll.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub task_identity: String,
    pub working_dir: PathBuf,
    pub alive: bool,
    pub idle: Duration,
    pub elapsed: Duration,
    pub tail: Vec<String>,
}

/// Instruction handed to a fresh agent.
pub fn initial_instruction(task: &Task) -> String {
    format!(
        "You are working on the project \"{}\".\n\n\
         Task:\n{}\n\n\
         Work in the current directory. Run the relevant tests before you finish, \
         then summarise what you changed and exit.",
        task.identity(),
        task.next_action().trim()
    )
}

pub struct SessionManager {
    isolation: Arc<dyn Isolation>,
    projects_root: PathBuf,
    tail_lines: usize,
    sessions: RwLock<HashMap<SessionId, AgentSession>>,
}

impl SessionManager {
    pub fn new(isolation: Arc<dyn Isolation>, config: &SessionConfig) -> Self {
        Self {
            isolation,
            projects_root: config.projects_root.clone(),
            tail_lines: config.tail_lines,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Directory a task's agent works in.
    pub fn working_dir_for(&self, task: &Task) -> PathBuf {
        task.working_dir()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.projects_root.join(task.identity()))
    }

    /// Start a session for `task`, or return the one already running for it.
    pub async fn start(&self, task: &Task) -> Result<SessionId, SessionError> {
        if let Some(existing) = self.session_for_task(task.identity()).await {
            if self.is_alive(&existing).await {
                debug!(task = task.identity(), session = %existing, "Session already running");
                return Ok(existing);
            }
        }

        let working_dir = self.working_dir_for(task);
        let handle = self
            .isolation
            .create(&working_dir, &initial_instruction(task))
            .await?;

        let now = Utc::now();
        let id = SessionId::new();
        info!(
            task = task.identity(),
            session = %id,
            isolation = self.isolation.kind(),
            dir = %working_dir.display(),
            "Session started"
        );

        self.sessions.write().await.insert(
            id.clone(),
            AgentSession {
                id: id.clone(),
                task_identity: task.identity().to_string(),
                working_dir,
                started_at: now,
                last_activity_at: now,
                output_tail: OutputTail::new(self.tail_lines),
                leaked: false,
                handle,
                seen_lines: 0,
            },
        );
        Ok(id)
    }

    async fn handle_of(&self, id: &SessionId) -> Result<IsolationHandle, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|s| s.handle.clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Poll the isolation once and fold new output into the session.
    pub async fn snapshot(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        let handle = self.handle_of(id).await?;
        let report = self.isolation.poll(&handle).await?;
        let now = Utc::now();

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if report.output_lines_total > session.seen_lines {
            let fresh = (report.output_lines_total - session.seen_lines) as usize;
            let skip = report.output_tail.len().saturating_sub(fresh);
            session
                .output_tail
                .extend(report.output_tail.iter().skip(skip).cloned());
            session.seen_lines = report.output_lines_total;
            let idle = chrono::Duration::from_std(report.idle)
                .unwrap_or_else(|_| chrono::Duration::zero());
            session.last_activity_at = now - idle;
        }

        let elapsed = (now - session.started_at).to_std().unwrap_or_default();

        Ok(SessionSnapshot {
            session_id: id.clone(),
            task_identity: session.task_identity.clone(),
            working_dir: session.working_dir.clone(),
            alive: report.alive,
            idle: report.idle,
            elapsed,
            tail: session.output_tail.lines(),
        })
    }

    pub async fn is_alive(&self, id: &SessionId) -> bool {
        match self.snapshot(id).await {
            Ok(snapshot) => snapshot.alive,
            Err(_) => false,
        }
    }

    pub async fn idle_duration(&self, id: &SessionId) -> Result<Duration, SessionError> {
        Ok(self.snapshot(id).await?.idle)
    }

    pub async fn tail(&self, id: &SessionId) -> Result<Vec<String>, SessionError> {
        Ok(self.snapshot(id).await?.tail)
    }

    pub async fn send_message(&self, id: &SessionId, text: &str) -> Result<(), SessionError> {
        let handle = self.handle_of(id).await?;
        self.isolation.send(&handle, text).await?;
        debug!(session = %id, "Guidance message sent");
        Ok(())
    }

    /// Stop a session. Unknown ids are already stopped.
    ///
    /// On failure the session stays tracked and is marked leaked.
    pub async fn stop(&self, id: &SessionId) -> Result<(), SessionError> {
        let handle = match self.handle_of(id).await {
            Ok(handle) => handle,
            Err(SessionError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match self.isolation.destroy(&handle).await {
            Ok(()) => {
                if let Some(session) = self.sessions.write().await.remove(id) {
                    info!(task = %session.task_identity, session = %id, "Session stopped");
                }
                Ok(())
            }
            Err(e) => {
                if let Some(session) = self.sessions.write().await.get_mut(id) {
                    session.leaked = true;
                }
                Err(SessionError::StopFailed(e.to_string()))
            }
        }
    }

    /// Stop every tracked session, returning the ones that failed.
    pub async fn stop_all(&self) -> Vec<(SessionId, SessionError)> {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(session = %id, "Failed to stop session: {}", e);
                failures.push((id, e));
            }
        }
        failures
    }

    /// Retry stopping leaked sessions. Returns the ones still leaking.
    pub async fn retry_leaked(&self) -> Vec<(SessionId, SessionError)> {
        let leaked: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.leaked)
            .map(|s| s.id.clone())
            .collect();
        let mut failures = Vec::new();
        for id in leaked {
            if let Err(e) = self.stop(&id).await {
                failures.push((id, e));
            }
        }
        failures
    }

    /// Live (non-leaked) session bound to `task_identity`.
    pub async fn session_for_task(&self, task_identity: &str) -> Option<SessionId> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.task_identity == task_identity && !s.leaked)
            .map(|s| s.id.clone())
    }

    /// Tracked sessions, leaked ones included.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get(&self, id: &SessionId) -> Option<AgentSession> {
        self.sessions.read().await.get(id).cloned()
    }
}
