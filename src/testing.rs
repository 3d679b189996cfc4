//! Scripted stand-ins for the model backend and the isolation mechanism.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmBackend, LlmError};
use crate::session::{Isolation, IsolationHandle, PollReport, SessionError};

type Responder = Box<dyn Fn(&str) -> Result<String, LlmError> + Send + Sync>;

/// Model backend driven by a closure over the prompt.
pub struct ScriptedLlm {
    responder: Responder,
    queue: Mutex<Option<VecDeque<Result<String, LlmError>>>>,
    prompts: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedLlm {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            queue: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Same answer to every prompt.
    pub fn always(answer: &str) -> Self {
        let answer = answer.to_string();
        Self::new(move |_| Ok(answer.clone()))
    }

    /// Answers in order; network errors once exhausted.
    pub fn sequence(answers: Vec<Result<String, LlmError>>) -> Self {
        let llm = Self::new(|_| Err(LlmError::network_error("script exhausted")));
        *llm.queue.lock().unwrap() = Some(answers.into());
        llm
    }

    /// Every call fails like an unreachable service.
    pub fn unavailable() -> Self {
        Self::new(|_| Err(LlmError::network_error("connection refused")))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str, _temperature: f64) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self
            .queue
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|queue| queue.pop_front());
        match queued {
            Some(answer) => answer,
            None => (self.responder)(prompt),
        }
    }
}

#[derive(Debug, Clone)]
struct FakeProcess {
    dir: PathBuf,
    alive: bool,
    idle: Duration,
    output: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    processes: HashMap<IsolationHandle, FakeProcess>,
    order: Vec<IsolationHandle>,
    created: Vec<(PathBuf, String)>,
    sent: Vec<(IsolationHandle, String)>,
    destroyed: Vec<IsolationHandle>,
    fail_next_create: u32,
    fail_destroy: bool,
}

/// Isolation whose processes are flags the test flips.
#[derive(Default)]
pub struct FakeIsolation {
    state: Mutex<FakeState>,
}

impl FakeIsolation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(working_dir, instruction)` passed to `create`.
    pub fn created(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().unwrap().created.clone()
    }

    /// Handles in creation order.
    pub fn handles(&self) -> Vec<IsolationHandle> {
        self.state.lock().unwrap().order.clone()
    }

    /// Most recent live handle created in `<root>/<identity>`.
    pub fn handle_for(&self, identity: &str) -> Option<IsolationHandle> {
        let state = self.state.lock().unwrap();
        state
            .order
            .iter()
            .rev()
            .find(|h| {
                state
                    .processes
                    .get(*h)
                    .map(|p| p.dir.ends_with(identity))
                    .unwrap_or(false)
            })
            .cloned()
    }

    pub fn running(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .processes
            .values()
            .filter(|p| p.alive)
            .count()
    }

    pub fn sent(&self) -> Vec<(IsolationHandle, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn destroyed(&self) -> Vec<IsolationHandle> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn set_alive(&self, handle: &IsolationHandle, alive: bool) {
        if let Some(p) = self.state.lock().unwrap().processes.get_mut(handle) {
            p.alive = alive;
        }
    }

    pub fn set_idle(&self, handle: &IsolationHandle, idle: Duration) {
        if let Some(p) = self.state.lock().unwrap().processes.get_mut(handle) {
            p.idle = idle;
        }
    }

    pub fn push_output<'a>(
        &self,
        handle: &IsolationHandle,
        lines: impl IntoIterator<Item = &'a str>,
    ) {
        if let Some(p) = self.state.lock().unwrap().processes.get_mut(handle) {
            p.output.extend(lines.into_iter().map(str::to_string));
            p.idle = Duration::ZERO;
        }
    }

    /// Make the next `create` fail.
    pub fn fail_next_create(&self) {
        self.fail_creates(1);
    }

    pub fn fail_creates(&self, count: u32) {
        self.state.lock().unwrap().fail_next_create = count;
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.state.lock().unwrap().fail_destroy = fail;
    }
}

#[async_trait]
impl Isolation for FakeIsolation {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn create(
        &self,
        working_dir: &Path,
        instruction: &str,
    ) -> Result<IsolationHandle, SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_create > 0 {
            state.fail_next_create -= 1;
            return Err(SessionError::StartFailed("scripted failure".to_string()));
        }
        state.next_id += 1;
        let handle = IsolationHandle::new(format!("fake-{}", state.next_id));
        state
            .created
            .push((working_dir.to_path_buf(), instruction.to_string()));
        state.processes.insert(
            handle.clone(),
            FakeProcess {
                dir: working_dir.to_path_buf(),
                alive: true,
                idle: Duration::ZERO,
                output: Vec::new(),
            },
        );
        state.order.push(handle.clone());
        Ok(handle)
    }

    async fn poll(&self, handle: &IsolationHandle) -> Result<PollReport, SessionError> {
        let state = self.state.lock().unwrap();
        let p = state
            .processes
            .get(handle)
            .ok_or_else(|| SessionError::NotFound(handle.as_str().to_string()))?;
        Ok(PollReport {
            alive: p.alive,
            idle: p.idle,
            output_tail: p.output.clone(),
            output_lines_total: p.output.len() as u64,
        })
    }

    async fn send(&self, handle: &IsolationHandle, text: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if !state.processes.contains_key(handle) {
            return Err(SessionError::NotFound(handle.as_str().to_string()));
        }
        state.sent.push((handle.clone(), text.to_string()));
        Ok(())
    }

    async fn destroy(&self, handle: &IsolationHandle) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_destroy {
            return Err(SessionError::StopFailed("scripted failure".to_string()));
        }
        if state.processes.remove(handle).is_some() {
            state.destroyed.push(handle.clone());
        }
        Ok(())
    }
}
