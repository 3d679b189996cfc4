//! SQLite-based task store.
//!
//! Rows live in a `tasks` table. Columns are read loosely (a human may have
//! typed `'high'` into `priority`), converted to JSON and validated the same
//! way as the file store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{FetchOutcome, RecordStore, StatusFields, StoreError, TaskRow, UpdateOutcome};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS tasks (
    identity TEXT PRIMARY KEY NOT NULL,
    priority INTEGER,
    status TEXT,
    next_action TEXT NOT NULL DEFAULT '',
    assigned_agent TEXT,
    plan_approved INTEGER NOT NULL DEFAULT 0,
    deadline TEXT,
    working_dir TEXT,
    note TEXT,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority);
"#;

const COLUMNS: &[&str] = &[
    "identity",
    "priority",
    "status",
    "next_action",
    "assigned_agent",
    "plan_approved",
    "deadline",
    "working_dir",
    "note",
];

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace a row. Used for seeding and by tests.
    pub async fn upsert(&self, row: &TaskRow) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let row = row.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO tasks
                    (identity, priority, status, next_action, assigned_agent, plan_approved,
                     deadline, working_dir, note, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.identity,
                    row.priority,
                    row.status,
                    row.next_action,
                    row.assigned_agent,
                    row.plan_approved,
                    row.deadline.map(|d| d.to_rfc3339()),
                    row.working_dir,
                    row.note,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Run raw SQL against the table, as a human with a database client would.
    pub async fn execute(&self, sql: &str) -> Result<usize, StoreError> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            Ok(conn.blocking_lock().execute(&sql, [])?)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let mut obj = Map::new();
    for (index, name) in COLUMNS.iter().enumerate() {
        let value = sql_to_json(row.get_ref(index)?);
        let value = match (*name, value) {
            ("plan_approved", Value::Number(n)) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
            (_, value) => value,
        };
        obj.insert(name.to_string(), value);
    }
    Ok(Value::Object(obj))
}

fn select_sql(filter: &str) -> String {
    format!("SELECT {} FROM tasks {}", COLUMNS.join(", "), filter)
}

#[async_trait]
impl RecordStore for SqliteTaskStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn fetch_all(&self) -> Result<FetchOutcome, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<FetchOutcome, StoreError> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&select_sql("ORDER BY identity"))?;
            let values = stmt
                .query_map([], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FetchOutcome::from_results(
                values.iter().map(TaskRow::from_value),
            ))
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn update(
        &self,
        identity: &str,
        fields: &StatusFields,
        expected_revision: &str,
    ) -> Result<UpdateOutcome, StoreError> {
        let conn = Arc::clone(&self.conn);
        let identity = identity.to_string();
        let fields = fields.clone();
        let expected_revision = expected_revision.to_string();

        tokio::task::spawn_blocking(move || -> Result<UpdateOutcome, StoreError> {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;

            let current = tx
                .query_row(&select_sql("WHERE identity = ?1"), params![identity], read_row)
                .optional()?;
            let Some(current) = current else {
                return Ok(UpdateOutcome::Conflict {
                    current_revision: None,
                });
            };
            let mut row =
                TaskRow::from_value(&current).map_err(|r| StoreError::Malformed(r.reason))?;
            if row.revision != expected_revision {
                return Ok(UpdateOutcome::Conflict {
                    current_revision: Some(row.revision),
                });
            }

            tx.execute(
                "UPDATE tasks
                 SET status = ?1, next_action = ?2, assigned_agent = ?3, note = ?4, updated_at = ?5
                 WHERE identity = ?6",
                params![
                    fields.status.as_str(),
                    fields.next_action,
                    fields.assigned_agent,
                    fields.note,
                    Utc::now().to_rfc3339(),
                    identity,
                ],
            )?;
            tx.commit()?;

            row.apply_fields(&fields);
            Ok(UpdateOutcome::Applied {
                revision: row.revision,
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn change_marker(&self) -> Result<Option<String>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<Option<String>, StoreError> {
            let conn = conn.blocking_lock();
            let data_version: i64 = conn.query_row("PRAGMA data_version", [], |r| r.get(0))?;
            let (count, latest): (i64, Option<String>) = conn.query_row(
                "SELECT COUNT(*), MAX(updated_at) FROM tasks",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok(Some(format!(
                "{}:{}:{}",
                data_version,
                count,
                latest.unwrap_or_default()
            )))
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}
