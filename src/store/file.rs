//! JSON file-based task store.
//!
//! The file holds a JSON array of row objects. Columns the controller does
//! not know about are preserved on write. Writers take an exclusive lock on
//! `<file>.lock` and replace the file atomically (temp file + rename).

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use fs2::FileExt;
use serde_json::Value;

use super::{
    existing_key, FetchOutcome, RecordStore, StatusFields, StoreError, TaskRow, UpdateOutcome,
};

#[derive(Debug, Clone)]
pub struct FileTaskStore {
    path: PathBuf,
}

impl FileTaskStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || f(path))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn lock_file(path: &Path) -> Result<File, StoreError> {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(PathBuf::from(lock_path))?)
}

fn read_rows(path: &Path) -> Result<Vec<Value>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::Unreachable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    match serde_json::from_slice::<Value>(&bytes)? {
        Value::Array(rows) => Ok(rows),
        _ => Err(StoreError::Malformed(format!(
            "{} does not contain a JSON array",
            path.display()
        ))),
    }
}

fn write_rows(path: &Path, rows: &[Value]) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(rows)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn set_column(obj: &mut serde_json::Map<String, Value>, name: &str, aliases: &[&str], value: Value) {
    let key = existing_key(obj, name, aliases);
    obj.insert(key, value);
}

#[async_trait]
impl RecordStore for FileTaskStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn fetch_all(&self) -> Result<FetchOutcome, StoreError> {
        self.blocking(|path| {
            let lock = lock_file(&path)?;
            lock.lock_shared()?;
            let rows = read_rows(&path);
            lock.unlock()?;
            Ok(FetchOutcome::from_results(
                rows?.iter().map(TaskRow::from_value),
            ))
        })
        .await
    }

    async fn update(
        &self,
        identity: &str,
        fields: &StatusFields,
        expected_revision: &str,
    ) -> Result<UpdateOutcome, StoreError> {
        let identity = identity.to_string();
        let fields = fields.clone();
        let expected_revision = expected_revision.to_string();

        self.blocking(move |path| {
            let lock = lock_file(&path)?;
            lock.lock_exclusive()?;
            let result = (|| -> Result<UpdateOutcome, StoreError> {
                let mut rows = read_rows(&path)?;
                let target = rows.iter().position(|v| {
                    TaskRow::from_value(v)
                        .map(|row| row.identity == identity)
                        .unwrap_or(false)
                });
                let Some(index) = target else {
                    return Ok(UpdateOutcome::Conflict {
                        current_revision: None,
                    });
                };

                let current = TaskRow::from_value(&rows[index])
                    .map_err(|r| StoreError::Malformed(r.reason))?;
                if current.revision != expected_revision {
                    return Ok(UpdateOutcome::Conflict {
                        current_revision: Some(current.revision),
                    });
                }

                let Some(obj) = rows[index].as_object_mut() else {
                    return Err(StoreError::Malformed("row is not an object".to_string()));
                };
                set_column(obj, "status", &[], Value::from(fields.status.as_str()));
                set_column(
                    obj,
                    "next_action",
                    &["nextAction"],
                    Value::from(fields.next_action.clone()),
                );
                set_column(
                    obj,
                    "assigned_agent",
                    &["assignedAgent"],
                    fields.assigned_agent.clone().map(Value::from).unwrap_or(Value::Null),
                );
                set_column(
                    obj,
                    "note",
                    &[],
                    fields.note.clone().map(Value::from).unwrap_or(Value::Null),
                );

                let updated = TaskRow::from_value(&rows[index])
                    .map_err(|r| StoreError::Malformed(r.reason))?;
                write_rows(&path, &rows)?;
                Ok(UpdateOutcome::Applied {
                    revision: updated.revision,
                })
            })();
            lock.unlock()?;
            result
        })
        .await
    }

    async fn change_marker(&self) -> Result<Option<String>, StoreError> {
        self.blocking(|path| {
            let meta = fs::metadata(&path).map_err(|e| {
                StoreError::Unreachable(format!("{}: {}", path.display(), e))
            })?;
            let modified = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            Ok(Some(format!("{}:{}", modified, meta.len())))
        })
        .await
    }
}
