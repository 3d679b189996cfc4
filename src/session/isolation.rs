//! Isolation mechanism seam.
//!
//! An isolation runs one agent process somewhere (a local child process, a
//! multiplexer pane, a container) and exposes the handful of lifecycle
//! operations the session manager needs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::SessionError;

/// Opaque reference to something an isolation created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsolationHandle(String);

impl IsolationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One observation of an isolated process.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub alive: bool,
    /// Time since the process last produced output (or since it started).
    pub idle: Duration,
    /// Most recent output lines, oldest first.
    pub output_tail: Vec<String>,
    /// Lines produced since creation; lets callers spot new output.
    pub output_lines_total: u64,
}

#[async_trait]
pub trait Isolation: Send + Sync {
    /// Short name for logs.
    fn kind(&self) -> &'static str;

    /// Start the agent in `working_dir` with its initial instruction.
    async fn create(
        &self,
        working_dir: &Path,
        instruction: &str,
    ) -> Result<IsolationHandle, SessionError>;

    async fn poll(&self, handle: &IsolationHandle) -> Result<PollReport, SessionError>;

    /// Deliver a guidance message to a running agent.
    async fn send(&self, handle: &IsolationHandle, text: &str) -> Result<(), SessionError>;

    /// Terminate and release everything behind `handle`.
    ///
    /// Destroying something that already exited succeeds.
    async fn destroy(&self, handle: &IsolationHandle) -> Result<(), SessionError>;
}
