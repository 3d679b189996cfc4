//! In-memory task store (non-persistent, for testing).
//!
//! Besides the `RecordStore` contract it exposes hooks that stand in for a
//! human editing the table.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    FetchOutcome, RecordStore, RejectedRow, StatusFields, StoreError, TaskRow, UpdateOutcome,
};

#[derive(Debug, Clone)]
enum Entry {
    Row(TaskRow),
    Malformed(RejectedRow),
}

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    entries: Arc<RwLock<Vec<Entry>>>,
    version: Arc<AtomicU64>,
    unreachable: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_rows(rows: impl IntoIterator<Item = TaskRow>) -> Self {
        let store = Self::new();
        for row in rows {
            store.insert(row).await;
        }
        store
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Add or replace a row.
    pub async fn insert(&self, mut row: TaskRow) {
        row.refresh_revision();
        let mut entries = self.entries.write().await;
        match entries
            .iter_mut()
            .find(|e| matches!(e, Entry::Row(r) if r.identity == row.identity))
        {
            Some(entry) => *entry = Entry::Row(row),
            None => entries.push(Entry::Row(row)),
        }
        self.bump();
    }

    /// Add a row that fails validation.
    pub async fn insert_malformed(&self, identity: Option<&str>, reason: &str) {
        self.entries.write().await.push(Entry::Malformed(RejectedRow {
            identity: identity.map(str::to_string),
            reason: reason.to_string(),
        }));
        self.bump();
    }

    /// Edit a row in place, as a human would.
    pub async fn edit<F>(&self, identity: &str, f: F) -> bool
    where
        F: FnOnce(&mut TaskRow),
    {
        let mut entries = self.entries.write().await;
        let Some(row) = entries.iter_mut().find_map(|e| match e {
            Entry::Row(r) if r.identity == identity => Some(r),
            _ => None,
        }) else {
            return false;
        };
        f(row);
        row.refresh_revision();
        self.bump();
        true
    }

    pub async fn remove(&self, identity: &str) {
        self.entries.write().await.retain(|e| match e {
            Entry::Row(r) => r.identity != identity,
            Entry::Malformed(r) => r.identity.as_deref() != Some(identity),
        });
        self.bump();
    }

    pub async fn row(&self, identity: &str) -> Option<TaskRow> {
        self.entries.read().await.iter().find_map(|e| match e {
            Entry::Row(r) if r.identity == identity => Some(r.clone()),
            _ => None,
        })
    }

    /// Make every call fail until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of applied updates.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("in-memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryTaskStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_all(&self) -> Result<FetchOutcome, StoreError> {
        self.check_reachable()?;
        let entries = self.entries.read().await;
        Ok(FetchOutcome::from_results(entries.iter().map(|e| match e {
            Entry::Row(r) => Ok(r.clone()),
            Entry::Malformed(r) => Err(r.clone()),
        })))
    }

    async fn update(
        &self,
        identity: &str,
        fields: &StatusFields,
        expected_revision: &str,
    ) -> Result<UpdateOutcome, StoreError> {
        self.check_reachable()?;
        let mut entries = self.entries.write().await;
        let Some(row) = entries.iter_mut().find_map(|e| match e {
            Entry::Row(r) if r.identity == identity => Some(r),
            _ => None,
        }) else {
            return Ok(UpdateOutcome::Conflict {
                current_revision: None,
            });
        };

        if row.revision != expected_revision {
            return Ok(UpdateOutcome::Conflict {
                current_revision: Some(row.revision.clone()),
            });
        }

        row.apply_fields(fields);
        let revision = row.revision.clone();
        self.bump();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(UpdateOutcome::Applied { revision })
    }

    async fn change_marker(&self) -> Result<Option<String>, StoreError> {
        self.check_reachable()?;
        Ok(Some(self.version.load(Ordering::SeqCst).to_string()))
    }
}
