//! In-process store for tests and embedded use.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{AuditQuery, AuditStore, CheckpointStore, SagaAuditLogEntry, SagaCheckpoint};
use crate::error::{Error, Result};
use crate::saga::{SagaId, SagaState};

/// Checkpoint and audit storage held in process memory.
///
/// Implements both [`CheckpointStore`] and [`AuditStore`] with the same
/// contract as [`PgStore`](crate::PgStore): terminal checkpoints are
/// immutable and audit entries are append-only. Cloning shares the
/// underlying data. Nothing survives a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    checkpoints: HashMap<SagaId, SagaCheckpoint>,
    audit: Vec<SagaAuditLogEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn checkpoint_count(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    /// Number of stored audit entries.
    pub fn audit_count(&self) -> usize {
        self.inner.lock().audit.len()
    }
}

impl CheckpointStore for MemoryStore {
    async fn create(&self, checkpoint: &SagaCheckpoint) -> Result<()> {
        let mut inner = self.inner.lock();

        match inner.checkpoints.entry(checkpoint.saga_id.clone()) {
            Entry::Occupied(_) => Err(Error::SagaExists(checkpoint.saga_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(checkpoint.clone());
                Ok(())
            }
        }
    }

    async fn save(&self, checkpoint: &SagaCheckpoint) -> Result<()> {
        let mut inner = self.inner.lock();

        let terminal = inner
            .checkpoints
            .get(&checkpoint.saga_id)
            .is_some_and(SagaCheckpoint::is_terminal);
        if terminal {
            return Err(Error::CheckpointImmutable(checkpoint.saga_id.clone()));
        }

        inner
            .checkpoints
            .insert(checkpoint.saga_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, saga_id: &SagaId) -> Result<Option<SagaCheckpoint>> {
        Ok(self.inner.lock().checkpoints.get(saga_id).cloned())
    }

    async fn query_stale(
        &self,
        state: SagaState,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<SagaCheckpoint>> {
        let inner = self.inner.lock();

        let mut stale: Vec<_> = inner
            .checkpoints
            .values()
            .filter(|cp| cp.state == state && cp.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.saga_id.cmp(&b.saga_id))
        });
        stale.truncate(limit as usize);

        Ok(stale)
    }
}

impl AuditStore for MemoryStore {
    async fn append(&self, entry: &SagaAuditLogEntry) -> Result<i64> {
        let mut inner = self.inner.lock();

        let id = inner.audit.len() as i64 + 1;
        let mut entry = entry.clone();
        entry.id = Some(id);
        inner.audit.push(entry);

        Ok(id)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<SagaAuditLogEntry>> {
        let inner = self.inner.lock();

        let mut entries: Vec<_> = inner
            .audit
            .iter()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            entries.truncate(limit as usize);
        }

        Ok(entries)
    }
}
