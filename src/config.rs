//! Configuration management for foreman.
//!
//! Configuration is read from environment variables:
//! - `FOREMAN_STORE` - Optional. Record store backend: `memory`, `file` or `sqlite`. Defaults to `file`.
//! - `FOREMAN_STORE_PATH` - Required for `file` and `sqlite`. Path of the task table.
//! - `FOREMAN_POLL_INTERVAL_SECS` - Optional. Seconds between cycles. Defaults to `30`.
//! - `FOREMAN_MAX_SESSIONS` - Optional. Concurrent agent sessions. Defaults to `2`.
//! - `FOREMAN_MAX_DISPATCH_ATTEMPTS` - Optional. Failed starts before review. Defaults to `3`.
//! - `FOREMAN_STALL_THRESHOLD_SECS` - Optional. Idle time before a stall check. Defaults to `900`.
//! - `FOREMAN_SESSION_TIMEOUT_SECS` - Optional. Maximum session runtime. Defaults to `7200`.
//! - `FOREMAN_CYCLE_DEADLINE_SECS` - Optional. Soft deadline for supervise work. Defaults to `60`.
//! - `FOREMAN_MAX_FETCH_FAILURES` - Optional. Consecutive failed fetches before exit. Defaults to `10`.
//! - `FOREMAN_FULL_FETCH_EVERY` - Optional. Force a full fetch every N cycles. Defaults to `10`.
//! - `FOREMAN_ORACLE_ENABLED` - Optional. Defaults to true when `OPENROUTER_API_KEY` is set.
//! - `OPENROUTER_API_KEY` - Required when the oracle is enabled.
//! - `FOREMAN_ORACLE_MODEL` - Optional. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `FOREMAN_ORACLE_TEMPERATURE` - Optional. Defaults to `0.1`.
//! - `FOREMAN_PLAN_THRESHOLD` - Optional. Complexity that forces a plan. Defaults to `moderate`.
//! - `FOREMAN_CONFIDENCE_THRESHOLD` - Optional. Minimum confidence to mark a task completed. Defaults to `0.7`.
//! - `FOREMAN_ORACLE_ATTEMPTS` - Optional. Attempts per oracle question. Defaults to `3`.
//! - `FOREMAN_ORACLE_TIMEOUT_SECS` - Optional. Timeout per oracle call. Defaults to `60`.
//! - `FOREMAN_AGENT_COMMAND` - Optional. Coding agent executable. Defaults to `claude`.
//! - `FOREMAN_AGENT_ARGS` - Optional. Whitespace-separated arguments placed before the instruction. Defaults to `--print`.
//! - `FOREMAN_PROJECTS_ROOT` - Optional. Parent of per-task working directories. Defaults to current directory.
//! - `FOREMAN_TAIL_LINES` - Optional. Output lines kept per session. Defaults to `200`.
//! - `FOREMAN_STOP_GRACE_SECS` - Optional. SIGTERM grace period before a kill. Defaults to `10`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::oracle::Complexity;
use crate::util::env_var_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which record store backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "file" | "json" => Ok(StoreBackend::File),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Task table location (file and sqlite backends)
    pub path: Option<PathBuf>,
}

/// Control loop knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub max_concurrent_sessions: usize,

    /// Consecutive failed session starts before a task goes to review
    pub max_dispatch_attempts: u32,

    /// Idle time after which the oracle is asked about a stall
    pub stall_threshold: Duration,

    /// Maximum runtime of one session
    pub session_timeout: Duration,

    /// Supervise work still running after this is deferred to the next cycle
    pub cycle_soft_deadline: Duration,

    /// Consecutive failed fetches before the controller gives up
    pub max_consecutive_fetch_failures: u32,

    /// Ignore the change marker every N cycles
    pub full_fetch_every: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_concurrent_sessions: 2,
            max_dispatch_attempts: 3,
            stall_threshold: Duration::from_secs(15 * 60),
            session_timeout: Duration::from_secs(2 * 60 * 60),
            cycle_soft_deadline: Duration::from_secs(60),
            max_consecutive_fetch_failures: 10,
            full_fetch_every: 10,
        }
    }
}

/// Decision oracle configuration.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// When false every question takes the conservative branch without a model call
    pub enabled: bool,

    /// OpenRouter API key
    pub api_key: Option<String>,

    /// Model identifier (OpenRouter format)
    pub model: String,

    pub temperature: f64,

    /// Complexity at or above which a plan is always required
    pub plan_threshold: Complexity,

    /// Completion verdicts below this confidence go to review
    pub confidence_threshold: f64,

    /// Attempts per question, first call included
    pub max_attempts: u32,

    pub call_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            model: "anthropic/claude-sonnet-4.5".to_string(),
            temperature: 0.1,
            plan_threshold: Complexity::Moderate,
            confidence_threshold: 0.7,
            max_attempts: 3,
            call_timeout: Duration::from_secs(60),
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

/// How agent sessions are launched.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub agent_command: String,
    pub agent_args: Vec<String>,

    /// Default working directory of a task is `<projects_root>/<identity>`
    pub projects_root: PathBuf,

    pub tail_lines: usize,
    pub stop_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent_command: "claude".to_string(),
            agent_args: vec!["--print".to_string()],
            projects_root: PathBuf::from("."),
            tail_lines: 200,
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub oracle: OracleConfig,
    pub session: SessionConfig,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if the oracle is enabled without
    /// `OPENROUTER_API_KEY`, or a file/sqlite store has no path.
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = StoreConfig {
            backend: env_parse("FOREMAN_STORE", StoreBackend::File)?,
            path: env_opt("FOREMAN_STORE_PATH").map(PathBuf::from),
        };

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            poll_interval: env_secs("FOREMAN_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            max_concurrent_sessions: env_parse(
                "FOREMAN_MAX_SESSIONS",
                defaults.max_concurrent_sessions,
            )?,
            max_dispatch_attempts: env_parse(
                "FOREMAN_MAX_DISPATCH_ATTEMPTS",
                defaults.max_dispatch_attempts,
            )?,
            stall_threshold: env_secs("FOREMAN_STALL_THRESHOLD_SECS", defaults.stall_threshold)?,
            session_timeout: env_secs("FOREMAN_SESSION_TIMEOUT_SECS", defaults.session_timeout)?,
            cycle_soft_deadline: env_secs(
                "FOREMAN_CYCLE_DEADLINE_SECS",
                defaults.cycle_soft_deadline,
            )?,
            max_consecutive_fetch_failures: env_parse(
                "FOREMAN_MAX_FETCH_FAILURES",
                defaults.max_consecutive_fetch_failures,
            )?,
            full_fetch_every: env_parse("FOREMAN_FULL_FETCH_EVERY", defaults.full_fetch_every)?,
        };

        let defaults = OracleConfig::default();
        let api_key = env_opt("OPENROUTER_API_KEY");
        let enabled = env_var_bool("FOREMAN_ORACLE_ENABLED", api_key.is_some());
        if enabled && api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()));
        }
        let plan_threshold = match env_opt("FOREMAN_PLAN_THRESHOLD") {
            Some(raw) => Complexity::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidValue("FOREMAN_PLAN_THRESHOLD".to_string(), raw.clone())
            })?,
            None => defaults.plan_threshold,
        };
        let oracle = OracleConfig {
            enabled,
            api_key,
            model: env_opt("FOREMAN_ORACLE_MODEL").unwrap_or(defaults.model),
            temperature: env_parse("FOREMAN_ORACLE_TEMPERATURE", defaults.temperature)?,
            plan_threshold,
            confidence_threshold: env_parse(
                "FOREMAN_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            )?,
            max_attempts: env_parse("FOREMAN_ORACLE_ATTEMPTS", defaults.max_attempts)?,
            call_timeout: env_secs("FOREMAN_ORACLE_TIMEOUT_SECS", defaults.call_timeout)?,
            retry_base_delay: defaults.retry_base_delay,
            retry_max_delay: defaults.retry_max_delay,
        };

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            agent_command: env_opt("FOREMAN_AGENT_COMMAND").unwrap_or(defaults.agent_command),
            agent_args: env_opt("FOREMAN_AGENT_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.agent_args),
            projects_root: env_opt("FOREMAN_PROJECTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::current_dir().unwrap_or(defaults.projects_root)),
            tail_lines: env_parse("FOREMAN_TAIL_LINES", defaults.tail_lines)?,
            stop_grace: env_secs("FOREMAN_STOP_GRACE_SECS", defaults.stop_grace)?,
        };

        let config = Self {
            store,
            scheduler,
            oracle,
            session,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name: &str, why: &str| {
            Err(ConfigError::InvalidValue(name.to_string(), why.to_string()))
        };

        if self.store.backend != StoreBackend::Memory && self.store.path.is_none() {
            return Err(ConfigError::MissingEnvVar("FOREMAN_STORE_PATH".to_string()));
        }
        if self.scheduler.poll_interval.is_zero() {
            return invalid("FOREMAN_POLL_INTERVAL_SECS", "must be positive");
        }
        if self.scheduler.max_concurrent_sessions == 0 {
            return invalid("FOREMAN_MAX_SESSIONS", "must be at least 1");
        }
        if self.scheduler.max_dispatch_attempts == 0 {
            return invalid("FOREMAN_MAX_DISPATCH_ATTEMPTS", "must be at least 1");
        }
        if self.scheduler.full_fetch_every == 0 {
            return invalid("FOREMAN_FULL_FETCH_EVERY", "must be at least 1");
        }
        if self.scheduler.max_consecutive_fetch_failures == 0 {
            return invalid("FOREMAN_MAX_FETCH_FAILURES", "must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.oracle.confidence_threshold) {
            return invalid("FOREMAN_CONFIDENCE_THRESHOLD", "must be within [0, 1]");
        }
        if !(0.0..=2.0).contains(&self.oracle.temperature) {
            return invalid("FOREMAN_ORACLE_TEMPERATURE", "must be within [0, 2]");
        }
        if self.oracle.max_attempts == 0 {
            return invalid("FOREMAN_ORACLE_ATTEMPTS", "must be at least 1");
        }
        if self.oracle.call_timeout.is_zero() {
            return invalid("FOREMAN_ORACLE_TIMEOUT_SECS", "must be positive");
        }
        if self.session.agent_command.trim().is_empty() {
            return invalid("FOREMAN_AGENT_COMMAND", "must not be empty");
        }
        if self.session.tail_lines == 0 {
            return invalid("FOREMAN_TAIL_LINES", "must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
impl OracleConfig {
    pub fn for_tests() -> Self {
        Self {
            enabled: true,
            api_key: Some("test-key".to_string()),
            call_timeout: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            ..Self::default()
        }
    }
}

#[cfg(test)]
impl SessionConfig {
    pub fn for_tests(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            agent_command: "true".to_string(),
            agent_args: Vec::new(),
            projects_root: projects_root.into(),
            tail_lines: 50,
            stop_grace: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
impl SchedulerConfig {
    pub fn for_tests() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            cycle_soft_deadline: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            store: StoreConfig {
                backend: StoreBackend::Memory,
                path: None,
            },
            scheduler: SchedulerConfig::for_tests(),
            oracle: OracleConfig::for_tests(),
            session: SessionConfig::for_tests("/projects"),
        }
    }
}
