//! Local child-process isolation.
//!
//! Runs the agent command as a child of the controller with piped stdio.
//! The initial instruction is passed as the last argument; guidance
//! messages are written to stdin one per line.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::isolation::{Isolation, IsolationHandle, PollReport};
use super::tail::OutputTail;
use super::SessionError;
use crate::config::SessionConfig;

struct OutputState {
    tail: OutputTail,
    last_output: Instant,
}

struct ProcessEntry {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Arc<std::sync::Mutex<OutputState>>,
    readers: Vec<JoinHandle<()>>,
}

/// Runs each agent as a local child process.
pub struct ProcessIsolation {
    command: String,
    args: Vec<String>,
    tail_lines: usize,
    stop_grace: Duration,
    processes: Mutex<HashMap<IsolationHandle, ProcessEntry>>,
}

impl ProcessIsolation {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            tail_lines: 200,
            stop_grace: Duration::from_secs(10),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.agent_command.clone(), config.agent_args.clone())
            .with_tail_lines(config.tail_lines)
            .with_stop_grace(config.stop_grace)
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }
}

fn spawn_reader<R>(stream: R, output: Arc<std::sync::Mutex<OutputState>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Agents print arbitrary bytes; decode lossily and keep draining.
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if let Ok(mut state) = output.lock() {
                state.tail.push(line);
                state.last_output = Instant::now();
            }
        }
    })
}

/// Ask the process to exit, then force-kill after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> Result<(), String> {
    if child.try_wait().map_err(|e| e.to_string())?.is_some() {
        return Ok(());
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a pid we own; no memory is touched.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            if let Ok(waited) = tokio::time::timeout(grace, child.wait()).await {
                return waited.map(|_| ()).map_err(|e| e.to_string());
            }
            debug!(pid, "Process ignored SIGTERM, killing");
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    child.kill().await.map_err(|e| e.to_string())
}

#[async_trait]
impl Isolation for ProcessIsolation {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn create(
        &self,
        working_dir: &Path,
        instruction: &str,
    ) -> Result<IsolationHandle, SessionError> {
        if !working_dir.is_dir() {
            return Err(SessionError::StartFailed(format!(
                "working directory {} does not exist",
                working_dir.display()
            )));
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(instruction)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SessionError::StartFailed(format!("failed to spawn {}: {}", self.command, e))
        })?;

        let output = Arc::new(std::sync::Mutex::new(OutputState {
            tail: OutputTail::new(self.tail_lines),
            last_output: Instant::now(),
        }));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&output)));
        }

        let handle = IsolationHandle::new(uuid::Uuid::new_v4().to_string());
        info!(
            handle = handle.as_str(),
            pid = ?child.id(),
            dir = %working_dir.display(),
            "Spawned agent process"
        );

        self.processes.lock().await.insert(
            handle.clone(),
            ProcessEntry {
                stdin: child.stdin.take(),
                child,
                output,
                readers,
            },
        );
        Ok(handle)
    }

    async fn poll(&self, handle: &IsolationHandle) -> Result<PollReport, SessionError> {
        let mut processes = self.processes.lock().await;
        let entry = processes
            .get_mut(handle)
            .ok_or_else(|| SessionError::NotFound(handle.as_str().to_string()))?;

        let alive = match entry.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => return Err(SessionError::Poll(e.to_string())),
        };

        let state = entry
            .output
            .lock()
            .map_err(|_| SessionError::Poll("output buffer poisoned".to_string()))?;
        Ok(PollReport {
            alive,
            idle: state.last_output.elapsed(),
            output_tail: state.tail.lines(),
            output_lines_total: state.tail.total(),
        })
    }

    async fn send(&self, handle: &IsolationHandle, text: &str) -> Result<(), SessionError> {
        let mut processes = self.processes.lock().await;
        let entry = processes
            .get_mut(handle)
            .ok_or_else(|| SessionError::NotFound(handle.as_str().to_string()))?;
        let stdin = entry
            .stdin
            .as_mut()
            .ok_or_else(|| SessionError::SendFailed("stdin is closed".to_string()))?;

        let mut payload = text.trim_end().to_string();
        payload.push('\n');
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| SessionError::SendFailed(e.to_string()))
    }

    async fn destroy(&self, handle: &IsolationHandle) -> Result<(), SessionError> {
        // Take the entry out so the grace period does not block other polls.
        let Some(mut entry) = self.processes.lock().await.remove(handle) else {
            return Ok(());
        };

        entry.stdin.take();
        if let Err(e) = terminate(&mut entry.child, self.stop_grace).await {
            warn!(handle = handle.as_str(), "Failed to terminate agent process: {}", e);
            self.processes.lock().await.insert(handle.clone(), entry);
            return Err(SessionError::StopFailed(e));
        }

        for reader in entry.readers {
            reader.abort();
        }
        debug!(handle = handle.as_str(), "Agent process destroyed");
        Ok(())
    }
}
