//! Task record store with pluggable backends.
//!
//! The record store is the external source of truth for tasks. Humans edit
//! it; the controller reads it every cycle and writes back only the status
//! fields it owns.
//!
//! Supports:
//! - `memory`: In-memory table (non-persistent, for testing)
//! - `file`: JSON array of rows in a single file
//! - `sqlite`: `tasks` table in a SQLite database

mod file;
mod memory;
mod sqlite;

pub use file::FileTaskStore;
pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};
use crate::task::TaskStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unreachable: {0}")]
    Unreachable(String),

    #[error("malformed record store contents: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(String),
}

/// One row of the external task table, as read.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub identity: String,
    pub priority: i64,
    /// Raw status column; parsed leniently by the task model.
    pub status: Option<String>,
    pub next_action: String,
    pub assigned_agent: Option<String>,
    pub plan_approved: bool,
    pub deadline: Option<DateTime<Utc>>,
    pub working_dir: Option<String>,
    pub note: Option<String>,
    /// Content fingerprint of the row.
    pub revision: String,
}

impl TaskRow {
    pub fn new(
        identity: impl Into<String>,
        priority: i64,
        status: Option<&str>,
        next_action: impl Into<String>,
    ) -> Self {
        let mut row = Self {
            identity: identity.into(),
            priority,
            status: status.map(str::to_string),
            next_action: next_action.into(),
            assigned_agent: None,
            plan_approved: false,
            deadline: None,
            working_dir: None,
            note: None,
            revision: String::new(),
        };
        row.refresh_revision();
        row
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self.refresh_revision();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self.refresh_revision();
        self
    }

    /// Status column parsed leniently; unknown or empty means Pending.
    pub fn parsed_status(&self) -> TaskStatus {
        self.status
            .as_deref()
            .and_then(TaskStatus::parse_external)
            .unwrap_or(TaskStatus::Pending)
    }

    /// Recompute `revision` after editing fields.
    pub fn refresh_revision(&mut self) {
        self.revision = self.fingerprint();
    }

    fn fingerprint(&self) -> String {
        let fields = [
            self.identity.clone(),
            self.priority.to_string(),
            self.status.clone().unwrap_or_default(),
            self.next_action.clone(),
            self.assigned_agent.clone().unwrap_or_default(),
            self.plan_approved.to_string(),
            self.deadline.map(|d| d.to_rfc3339()).unwrap_or_default(),
            self.working_dir.clone().unwrap_or_default(),
            self.note.clone().unwrap_or_default(),
        ];
        let mut hasher = Sha256::new();
        hasher.update(fields.join("\x1f").as_bytes());
        hex::encode(&hasher.finalize()[..12])
    }

    /// Overwrite the controller-owned columns.
    pub fn apply_fields(&mut self, fields: &StatusFields) {
        self.status = Some(fields.status.as_str().to_string());
        self.next_action = fields.next_action.clone();
        self.assigned_agent = fields.assigned_agent.clone();
        self.note = fields.note.clone();
        self.refresh_revision();
    }

    /// Validate a loosely typed row object.
    ///
    /// Column names are matched in snake_case or camelCase. Only `identity`
    /// (or `project`) and `priority` are required.
    pub fn from_value(value: &Value) -> Result<TaskRow, RejectedRow> {
        let obj = value.as_object().ok_or_else(|| RejectedRow {
            identity: None,
            reason: "row is not an object".to_string(),
        })?;

        let identity = column(obj, "identity", &["project", "name"])
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RejectedRow {
                identity: None,
                reason: "missing identity".to_string(),
            })?
            .to_string();

        let reject = |reason: String| RejectedRow {
            identity: Some(identity.clone()),
            reason,
        };

        let priority = match column(obj, "priority", &[]) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or_else(|| reject(format!("priority {} is not an integer", n)))?,
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| reject(format!("priority '{}' is not an integer", s)))?,
            _ => return Err(reject("missing priority".to_string())),
        };

        let deadline = match optional_string(obj, "deadline", &[]) {
            Some(raw) => Some(parse_deadline(&raw).ok_or_else(|| {
                reject(format!("deadline '{}' is not a date", raw))
            })?),
            None => None,
        };

        let plan_approved = match column(obj, "plan_approved", &["planApproved"]) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => matches!(
                s.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "approved"
            ),
            _ => false,
        };

        let mut row = TaskRow {
            identity: identity.clone(),
            priority,
            status: optional_string(obj, "status", &[]),
            next_action: optional_string(obj, "next_action", &["nextAction"]).unwrap_or_default(),
            assigned_agent: optional_string(obj, "assigned_agent", &["assignedAgent"]),
            plan_approved,
            deadline,
            working_dir: optional_string(obj, "working_dir", &["workingDir", "workingDirectory"]),
            note: optional_string(obj, "note", &[]),
            revision: String::new(),
        };
        row.refresh_revision();
        Ok(row)
    }

    /// Canonical object form, used when creating rows.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "identity": self.identity,
            "priority": self.priority,
            "status": self.status,
            "next_action": self.next_action,
            "assigned_agent": self.assigned_agent,
            "plan_approved": self.plan_approved,
            "deadline": self.deadline.map(|d| d.to_rfc3339()),
            "working_dir": self.working_dir,
            "note": self.note,
        })
    }
}

fn column<'a>(obj: &'a Map<String, Value>, name: &str, aliases: &[&str]) -> Option<&'a Value> {
    std::iter::once(name)
        .chain(aliases.iter().copied())
        .find_map(|key| obj.get(key))
        .filter(|v| !v.is_null())
}

fn optional_string(obj: &Map<String, Value>, name: &str, aliases: &[&str]) -> Option<String> {
    match column(obj, name, aliases)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Key under which `name` lives in `obj`, so writes keep the existing spelling.
pub(crate) fn existing_key(obj: &Map<String, Value>, name: &str, aliases: &[&str]) -> String {
    std::iter::once(name)
        .chain(aliases.iter().copied())
        .find(|key| obj.contains_key(*key))
        .unwrap_or(name)
        .to_string()
}

fn parse_deadline(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// A row that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    /// Present when the row had a usable identity.
    pub identity: Option<String>,
    pub reason: String,
}

/// Result of a full fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub rows: Vec<TaskRow>,
    pub rejected: Vec<RejectedRow>,
}

impl FetchOutcome {
    /// Collect validated rows, rejecting repeated identities after the first.
    pub fn from_results(results: impl IntoIterator<Item = Result<TaskRow, RejectedRow>>) -> Self {
        let mut outcome = FetchOutcome::default();
        let mut seen = HashSet::new();
        for result in results {
            match result {
                Ok(row) if !seen.insert(row.identity.clone()) => {
                    outcome.rejected.push(RejectedRow {
                        identity: Some(row.identity.clone()),
                        reason: format!("duplicate identity '{}'", row.identity),
                    });
                }
                Ok(row) => outcome.rows.push(row),
                Err(rejected) => outcome.rejected.push(rejected),
            }
        }
        outcome
    }

    /// Every identity the store still knows about, malformed rows included.
    pub fn present_identities(&self) -> HashSet<&str> {
        self.rows
            .iter()
            .map(|r| r.identity.as_str())
            .chain(self.rejected.iter().filter_map(|r| r.identity.as_deref()))
            .collect()
    }
}

/// Controller-owned columns written back after a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFields {
    pub status: TaskStatus,
    pub next_action: String,
    pub assigned_agent: Option<String>,
    pub note: Option<String>,
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied { revision: String },
    /// The row changed since `expected_revision`, or no longer exists.
    Conflict { current_revision: Option<String> },
}

/// Record store trait - implemented by all storage backends.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Read every row. Idempotent.
    async fn fetch_all(&self) -> Result<FetchOutcome, StoreError>;

    /// Write the status fields of one row if its revision still matches.
    async fn update(
        &self,
        identity: &str,
        fields: &StatusFields,
        expected_revision: &str,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Cheap marker that changes whenever the contents might have changed.
    async fn change_marker(&self) -> Result<Option<String>, StoreError> {
        Ok(None)
    }
}

/// Open the configured backend.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn RecordStore>, StoreError> {
    let store: Arc<dyn RecordStore> = match config.backend {
        StoreBackend::Memory => Arc::new(InMemoryTaskStore::new()),
        StoreBackend::File => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| StoreError::Unreachable("file store needs a path".to_string()))?;
            Arc::new(FileTaskStore::new(path))
        }
        StoreBackend::Sqlite => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| StoreError::Unreachable("sqlite store needs a path".to_string()))?;
            Arc::new(SqliteTaskStore::new(path).await?)
        }
    };
    tracing::info!(backend = store.backend_name(), "Record store opened");
    Ok(store)
}
