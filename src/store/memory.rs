use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{FailPoint, SaveStore, StoreError, WriteBatch, WriteOp};
use crate::identity::UserId;
use crate::save::{SaveMetadata, StoredPayload};

#[derive(Debug, Clone, Default)]
struct Collections {
    metadata: HashMap<String, SaveMetadata>,
    payloads: HashMap<String, StoredPayload>,
}

impl Collections {
    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::PutMetadata(metadata) => {
                self.metadata.insert(metadata.id.clone(), metadata);
            }
            WriteOp::PutPayload { id, payload } => {
                self.payloads.insert(id, payload);
            }
            WriteOp::DeleteMetadata { id } => {
                self.metadata.remove(&id);
            }
            WriteOp::DeletePayload { id } => {
                self.payloads.remove(&id);
            }
        }
    }

    fn stored_bytes(&self) -> u64 {
        self.payloads.values().map(|p| p.info.compressed_size).sum()
    }
}

/// In-process store. Serves as the remote in tests and as a scratch backend;
/// outages and storage limits can be simulated.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    state: Mutex<Collections>,
    fail_point: FailPoint,
    available: AtomicBool,
    capacity_bytes: Option<u64>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(Collections::default()),
            fail_point: FailPoint::default(),
            available: AtomicBool::new(true),
            capacity_bytes: None,
        }
    }

    /// Reject commits that would grow stored payloads past `bytes`
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity_bytes = Some(bytes);
        self
    }

    pub fn fail_point(&self) -> &FailPoint {
        &self.fail_point
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn metadata_count(&self) -> usize {
        self.lock().metadata.len()
    }

    pub fn payload_count(&self) -> usize {
        self.lock().payloads.len()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("{} store is offline", self.name)))
        }
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SaveStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.ensure_available()?;

        let mut state = self.lock();
        let mut staged = state.clone();
        for (index, op) in batch.ops().iter().enumerate() {
            self.fail_point.check(index)?;
            staged.apply(op.clone());
        }

        if let Some(limit) = self.capacity_bytes {
            let used = staged.stored_bytes();
            if used > limit && used > state.stored_bytes() {
                return Err(StoreError::QuotaExceeded { used, limit });
            }
        }

        *state = staged;
        Ok(())
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<SaveMetadata>, StoreError> {
        self.ensure_available()?;
        Ok(self.lock().metadata.get(id).cloned())
    }

    async fn get_payload(&self, id: &str) -> Result<Option<StoredPayload>, StoreError> {
        self.ensure_available()?;
        Ok(self.lock().payloads.get(id).cloned())
    }

    async fn query_metadata(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<SaveMetadata>, StoreError> {
        self.ensure_available()?;
        let mut saves: Vec<SaveMetadata> = self
            .lock()
            .metadata
            .values()
            .filter(|m| &m.user == user)
            .cloned()
            .collect();
        saves.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.slot.cmp(&b.slot)));
        saves.truncate(limit);
        Ok(saves)
    }
}
