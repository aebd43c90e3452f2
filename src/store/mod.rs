//! Record stores for save metadata and payloads.
//!
//! Metadata and payload live in separate collections. Every write goes through
//! [`SaveStore::commit`] so a half-written save can never be observed.

mod error;
mod memory;
mod sqlite;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::sync::Mutex;

use crate::identity::UserId;
use crate::save::{SaveMetadata, SaveRecord, StoredPayload};

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    PutMetadata(SaveMetadata),
    PutPayload { id: String, payload: StoredPayload },
    DeleteMetadata { id: String },
    DeletePayload { id: String },
}

/// Ordered group of writes applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata first, then payload
    pub fn put_record(self, record: &SaveRecord) -> Self {
        self.put_metadata(record.metadata.clone())
            .put_payload(&record.metadata.id, record.payload.clone())
    }

    pub fn delete_record(self, id: &str) -> Self {
        self.delete_metadata(id).delete_payload(id)
    }

    pub fn put_metadata(mut self, metadata: SaveMetadata) -> Self {
        self.ops.push(WriteOp::PutMetadata(metadata));
        self
    }

    pub fn put_payload(mut self, id: &str, payload: StoredPayload) -> Self {
        self.ops.push(WriteOp::PutPayload {
            id: id.to_string(),
            payload,
        });
        self
    }

    pub fn delete_metadata(mut self, id: &str) -> Self {
        self.ops.push(WriteOp::DeleteMetadata { id: id.to_string() });
        self
    }

    pub fn delete_payload(mut self, id: &str) -> Self {
        self.ops.push(WriteOp::DeletePayload { id: id.to_string() });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait]
pub trait SaveStore: Send + Sync {
    /// Short label used in logs ("remote", "local", ...)
    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<(), StoreError>;

    /// Apply every operation in the batch, or none of them
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    async fn get_metadata(&self, id: &str) -> Result<Option<SaveMetadata>, StoreError>;

    async fn get_payload(&self, id: &str) -> Result<Option<StoredPayload>, StoreError>;

    /// The user's saves, most recently updated first
    async fn query_metadata(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<SaveMetadata>, StoreError>;

    /// Metadata and payload together; `None` unless both halves exist
    async fn get_record(&self, id: &str) -> Result<Option<SaveRecord>, StoreError> {
        let Some(metadata) = self.get_metadata(id).await? else {
            return Ok(None);
        };
        match self.get_payload(id).await? {
            Some(payload) => Ok(Some(SaveRecord { metadata, payload })),
            None => Err(StoreError::Corrupted(format!(
                "save {id} has metadata but no payload"
            ))),
        }
    }
}

/// Failure injection for commits: the next commit fails once `writes`
/// operations of its batch have been applied.
#[derive(Debug, Default)]
pub struct FailPoint {
    armed: Mutex<Option<usize>>,
}

impl FailPoint {
    pub fn fail_after(&self, writes: usize) {
        *self.lock() = Some(writes);
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    /// Called before applying the operation at `index`; disarms when it fires
    pub(crate) fn check(&self, index: usize) -> Result<(), StoreError> {
        let mut armed = self.lock();
        if *armed == Some(index) {
            *armed = None;
            return Err(StoreError::Injected(index));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<usize>> {
        match self.armed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
