//! Save, load, list, delete and sync of game saves between this device and the cloud.
//!
//! Every operation runs under the retry executor and, once retries are
//! exhausted, under the recovery coordinator. While the service mode allows
//! cloud access the remote store is authoritative and each write is mirrored
//! locally; otherwise saves land in the local store as `pending` and are
//! uploaded by the next sync.

mod codec;
mod decision;
pub mod journal;
mod types;

pub use codec::{CodecError, GZIP, GzipCodec, IDENTITY, SaveCodec};
pub use decision::{SyncAction, SyncDecision, SyncRule, determine_action};
pub use journal::{OperationJournal, OperationLog};
pub use types::{
    ConflictResolution, LoadedSave, OpResult, PayloadInfo, SaveKey, SaveLimits, SaveMetadata,
    SaveRecord, StoredPayload, SyncStatus,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{CanonicalError, RawFailure};
use crate::events::{EventBus, SyncEvent};
use crate::identity::UserId;
use crate::quota::SaveListing;
use crate::recovery::{RecoveryCoordinator, RecoverySettings, ServiceMode, ServiceModeController};
use crate::retry::{RetryExecutor, RetryPolicies, RetryPolicy};
use crate::store::{SaveStore, WriteBatch};
use crate::ui::prelude::*;

/// Outcome for one slot of [`SaveSyncCoordinator::sync_all`]
#[derive(Debug, Clone, Serialize)]
pub struct SlotSync {
    pub slot: u32,
    pub decision: Option<SyncDecision>,
    pub error: Option<CanonicalError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub slots: Vec<SlotSync>,
}

impl SyncReport {
    pub fn count(&self, action: SyncAction) -> usize {
        self.slots
            .iter()
            .filter(|s| s.decision.as_ref().map(|d| d.action) == Some(action))
            .count()
    }

    /// Slots that failed for a reason other than a conflict
    pub fn failures(&self) -> impl Iterator<Item = &SlotSync> {
        self.slots
            .iter()
            .filter(|s| s.error.is_some() && s.decision.is_none())
    }
}

pub struct SaveSyncCoordinator {
    remote: Arc<dyn SaveStore>,
    local: Arc<dyn SaveStore>,
    codec: Arc<dyn SaveCodec>,
    executor: RetryExecutor,
    recovery: Arc<RecoveryCoordinator>,
    events: EventBus,
    policies: RetryPolicies,
    limits: SaveLimits,
    recovery_attempts: u32,
    journal: Option<Arc<OperationJournal>>,
}

impl SaveSyncCoordinator {
    pub fn new(
        remote: Arc<dyn SaveStore>,
        local: Arc<dyn SaveStore>,
        codec: Arc<dyn SaveCodec>,
        recovery: Arc<RecoveryCoordinator>,
        events: EventBus,
    ) -> Self {
        Self {
            remote,
            local,
            codec,
            executor: RetryExecutor::new(*recovery.classifier()),
            recovery,
            events,
            policies: RetryPolicies::default(),
            limits: SaveLimits::default(),
            recovery_attempts: RecoverySettings::default().max_attempts,
            journal: None,
        }
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_limits(mut self, limits: SaveLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_recovery_attempts(mut self, attempts: u32) -> Self {
        self.recovery_attempts = attempts;
        self
    }

    pub fn with_journal(mut self, journal: Arc<OperationJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn limits(&self) -> &SaveLimits {
        &self.limits
    }

    pub fn modes(&self) -> &Arc<ServiceModeController> {
        self.recovery.modes()
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }

    pub async fn save(
        &self,
        user: &UserId,
        slot: u32,
        name: &str,
        data: &[u8],
    ) -> OpResult<SaveMetadata> {
        let started = Instant::now();
        let outcome = match self.prepare_save(user, slot, name, data) {
            Ok(record) => {
                let record = &record;
                self.guarded(&self.policies.critical, "save", move || {
                    self.save_once(record)
                })
                .await
            }
            Err(failure) => Err(self.classify(failure)),
        };
        self.finish("save", user, Some(slot), started, outcome)
    }

    pub async fn load(&self, user: &UserId, slot: u32) -> OpResult<LoadedSave> {
        let started = Instant::now();
        let key = SaveKey::new(user, slot);
        let outcome = match self.check_slot(slot) {
            Ok(()) => {
                let key = &key;
                self.guarded(&self.policies.network, "load", move || self.load_once(key))
                    .await
            }
            Err(failure) => Err(self.classify(failure)),
        };
        self.finish("load", user, Some(slot), started, outcome)
    }

    /// Saves without payloads, most recently updated first, capped at `max_saves`
    pub async fn list(&self, user: &UserId) -> OpResult<Vec<SaveMetadata>> {
        let started = Instant::now();
        let outcome = self
            .guarded(&self.policies.network, "list", move || self.list_once(user))
            .await;
        self.finish("list", user, None, started, outcome)
    }

    pub async fn delete(&self, user: &UserId, slot: u32) -> OpResult<()> {
        let started = Instant::now();
        let key = SaveKey::new(user, slot);
        let outcome = match self.check_slot(slot) {
            Ok(()) => {
                let key = &key;
                self.guarded(&self.policies.network, "delete", move || {
                    self.delete_once(key)
                })
                .await
            }
            Err(failure) => Err(self.classify(failure)),
        };
        self.finish("delete", user, Some(slot), started, outcome)
    }

    /// Reconcile one slot. `local_candidate` overrides what the local store holds.
    ///
    /// A conflict is reported as a failed result carrying both the
    /// `sync-conflict` error and the decision; the local copy is marked
    /// `conflict` until [`Self::resolve_conflict`] settles it. Any other failure
    /// while still in cloud mode marks the local copy `error`.
    pub async fn sync_slot(
        &self,
        user: &UserId,
        slot: u32,
        local_candidate: Option<SaveRecord>,
    ) -> OpResult<SyncDecision> {
        let started = Instant::now();
        let candidate = local_candidate.as_ref();
        let outcome = self
            .guarded(&self.policies.background, "sync", move || {
                self.sync_once(user, slot, candidate)
            })
            .await;

        match outcome {
            Ok(decision) if decision.action == SyncAction::Conflict => {
                emit(
                    Level::Warn,
                    "sync.conflict",
                    &format!(
                        "Slot {slot} for {user} was changed on two devices at the same time"
                    ),
                    Some(serde_json::json!({
                        "user": user.as_str(),
                        "slot": slot,
                        "rule": decision.rule.as_str(),
                    })),
                );
                self.events.publish(SyncEvent::ConflictDetected {
                    user: user.clone(),
                    slot,
                    decision: decision.clone(),
                });
                let error = self.classify(RawFailure::coded(
                    "sync-conflict",
                    format!("slot {slot}: {}", decision.rule.as_str()),
                ));
                let mut result = self.finish("sync", user, Some(slot), started, Err(error));
                result.data = Some(decision);
                result
            }
            Err(error) => {
                self.mark_sync_error(user, slot).await;
                self.finish("sync", user, Some(slot), started, Err(error))
            }
            ok => self.finish("sync", user, Some(slot), started, ok),
        }
    }

    /// Flag the local copy after a failed sync. Skipped when the service has
    /// left cloud mode, since the save then just waits as `pending`.
    async fn mark_sync_error(&self, user: &UserId, slot: u32) {
        if !self.modes().get_mode().allows_cloud() {
            return;
        }
        let id = SaveKey::new(user, slot).id();
        let mut metadata = match self.local.get_metadata(&id).await {
            Ok(Some(metadata)) => metadata,
            _ => return,
        };
        if matches!(metadata.sync_status, SyncStatus::Error | SyncStatus::Conflict) {
            return;
        }
        metadata.sync_status = SyncStatus::Error;
        if let Err(err) = self.local.commit(WriteBatch::new().put_metadata(metadata)).await {
            emit(
                Level::Debug,
                "sync.mark_failed",
                &format!(
                    "Could not flag slot {slot} in the {} store: {err}",
                    self.local.name()
                ),
                None,
            );
        }
    }

    /// Sync every slot that exists on either side
    pub async fn sync_all(&self, user: &UserId) -> OpResult<SyncReport> {
        let started = Instant::now();
        let slots = self
            .guarded(&self.policies.network, "sync_all", move || {
                self.known_slots(user)
            })
            .await;

        let outcome = match slots {
            Ok(slots) => {
                let mut report = SyncReport::default();
                for slot in slots {
                    let result = self.sync_slot(user, slot, None).await;
                    report.slots.push(SlotSync {
                        slot,
                        decision: result.data,
                        error: result.error,
                    });
                }
                emit(
                    Level::Info,
                    "sync.completed",
                    &format!(
                        "Synced {} slot(s): {} uploaded, {} downloaded, {} conflict(s)",
                        report.slots.len(),
                        report.count(SyncAction::Upload),
                        report.count(SyncAction::Download),
                        report.count(SyncAction::Conflict),
                    ),
                    Some(serde_json::json!({
                        "user": user.as_str(),
                        "slots": report.slots.len(),
                    })),
                );
                Ok(report)
            }
            Err(error) => Err(error),
        };
        self.finish("sync_all", user, None, started, outcome)
    }

    /// Operator override for a slot in conflict
    pub async fn resolve_conflict(
        &self,
        user: &UserId,
        slot: u32,
        resolution: ConflictResolution,
    ) -> OpResult<SaveMetadata> {
        let started = Instant::now();
        let key = SaveKey::new(user, slot);
        let key = &key;
        let outcome = self
            .guarded(&self.policies.critical, "resolve", move || {
                self.resolve_once(key, resolution)
            })
            .await;
        self.finish("resolve", user, Some(slot), started, outcome)
    }

    /// Probe connectivity and, if it is back, return to cloud mode and leave fallback mode
    pub async fn restore_cloud(&self) -> bool {
        let modes = self.modes();
        if modes.is_cloud_enabled() {
            return true;
        }
        if !modes.attempt_restoration().await {
            return false;
        }
        modes.set_mode(ServiceMode::CloudEnabled, "connectivity restored");
        self.recovery.disable_fallback_mode();
        true
    }

    async fn guarded<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        name: &str,
        operation: F,
    ) -> Result<T, CanonicalError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        let executor = &self.executor;
        let operation = &operation;
        self.recovery
            .execute_with_recovery(
                move || async move { executor.run(operation, policy).await.into_result() },
                name,
                self.recovery_attempts,
            )
            .await
    }

    fn classify(&self, failure: RawFailure) -> CanonicalError {
        self.recovery.classifier().classify(&failure)
    }

    fn check_slot(&self, slot: u32) -> Result<(), RawFailure> {
        if slot < self.limits.min_slot || slot > self.limits.max_slot {
            return Err(RawFailure::coded(
                "out-of-range",
                format!(
                    "slot {slot} is outside {}..={}",
                    self.limits.min_slot, self.limits.max_slot
                ),
            ));
        }
        Ok(())
    }

    fn slot_capacity(&self) -> usize {
        (self.limits.max_slot - self.limits.min_slot) as usize + 1
    }

    fn prepare_save(
        &self,
        user: &UserId,
        slot: u32,
        name: &str,
        data: &[u8],
    ) -> Result<SaveRecord, RawFailure> {
        self.check_slot(slot)?;
        if data.len() as u64 > self.limits.max_payload_bytes {
            return Err(RawFailure::coded(
                "invalid-argument",
                format!(
                    "save is {} bytes, limit is {}",
                    data.len(),
                    self.limits.max_payload_bytes
                ),
            ));
        }

        let payload = self.codec.encode(data)?;
        let key = SaveKey::new(user, slot);
        let now = Utc::now();
        let name = match name.trim() {
            "" => format!("Slot {slot}"),
            trimmed => trimmed.to_string(),
        };
        Ok(SaveRecord {
            metadata: SaveMetadata {
                id: key.id(),
                user: key.user,
                slot,
                name,
                payload: payload.info.clone(),
                created_at: now,
                updated_at: now,
                last_played_at: Some(now),
                sync_status: SyncStatus::Pending,
            },
            payload,
        })
    }

    async fn save_once(&self, record: &SaveRecord) -> Result<SaveMetadata, RawFailure> {
        let mode = self.modes().get_mode();
        let target = if mode.allows_cloud() {
            &self.remote
        } else {
            &self.local
        };

        let mut record = record.clone();
        if let Some(existing) = target.get_metadata(&record.metadata.id).await? {
            record.metadata.created_at = existing.created_at;
        }

        if mode.allows_cloud() {
            let synced = record.with_status(SyncStatus::Synced);
            self.remote
                .commit(WriteBatch::new().put_record(&synced))
                .await?;
            self.mirror_locally(&synced).await;
            emit(
                Level::Debug,
                "save.commit",
                &format!("Saved slot {} to the cloud", synced.metadata.slot),
                Some(serde_json::json!({
                    "id": synced.metadata.id,
                    "compressed_size": synced.metadata.payload.compressed_size,
                })),
            );
            Ok(synced.metadata)
        } else {
            let pending = record.with_status(SyncStatus::Pending);
            self.local
                .commit(WriteBatch::new().put_record(&pending))
                .await?;
            emit(
                Level::Info,
                "save.local_only",
                &format!(
                    "Saved slot {} on this device ({mode}); it will be uploaded on the next sync",
                    pending.metadata.slot
                ),
                Some(serde_json::json!({
                    "id": pending.metadata.id,
                    "mode": mode.as_str(),
                })),
            );
            Ok(pending.metadata)
        }
    }

    async fn mirror_locally(&self, record: &SaveRecord) {
        if let Err(err) = self.local.commit(WriteBatch::new().put_record(record)).await {
            emit(
                Level::Warn,
                "save.mirror_failed",
                &format!("Could not keep a local copy of slot {}: {err}", record.metadata.slot),
                Some(serde_json::json!({
                    "id": record.metadata.id,
                    "store": self.local.name(),
                })),
            );
        }
    }

    async fn load_once(&self, key: &SaveKey) -> Result<LoadedSave, RawFailure> {
        let id = key.id();
        let record = if self.modes().is_cloud_enabled() {
            let remote = self.remote.get_record(&id).await?;
            // A pending local save can be newer than the cloud copy
            let local = match self.local.get_record(&id).await {
                Ok(local) => local,
                Err(err) => {
                    emit(
                        Level::Debug,
                        "load.local_unreadable",
                        &format!("Ignoring local copy of {id}: {err}"),
                        None,
                    );
                    None
                }
            };
            match (remote, local) {
                (Some(remote), Some(local)) if local.updated_at() > remote.updated_at() => {
                    Some(local)
                }
                (Some(remote), _) => Some(remote),
                (None, local) => local,
            }
        } else {
            self.local.get_record(&id).await?
        };

        let Some(record) = record else {
            return Err(RawFailure::coded(
                "not-found",
                format!("no save in slot {} for {}", key.slot, key.user),
            ));
        };
        let data = self.decode_verified(&record)?;
        Ok(LoadedSave {
            metadata: record.metadata,
            data,
        })
    }

    fn decode_verified(&self, record: &SaveRecord) -> Result<Vec<u8>, RawFailure> {
        let data = self.codec.decode(&record.payload)?;
        self.codec.verify(&data, record.checksum())?;
        Ok(data)
    }

    async fn list_once(&self, user: &UserId) -> Result<Vec<SaveMetadata>, RawFailure> {
        let limit = self.limits.max_saves;
        let local = self.local.query_metadata(user, limit).await;
        if !self.modes().is_cloud_enabled() {
            return Ok(local?);
        }

        let remote = self.remote.query_metadata(user, limit).await?;
        let local = local.unwrap_or_else(|err| {
            emit(
                Level::Debug,
                "list.local_unreadable",
                &format!("Listing without local saves: {err}"),
                None,
            );
            Vec::new()
        });
        Ok(merge_listings(remote, local, limit))
    }

    async fn delete_once(&self, key: &SaveKey) -> Result<(), RawFailure> {
        let id = key.id();
        let batch = WriteBatch::new().delete_record(&id);
        if self.modes().is_cloud_enabled() {
            self.remote.commit(batch.clone()).await?;
            if let Err(err) = self.local.commit(batch).await {
                emit(
                    Level::Warn,
                    "delete.mirror_failed",
                    &format!("Deleted {id} in the cloud but not on this device: {err}"),
                    Some(serde_json::json!({
                        "id": id,
                        "store": self.local.name(),
                    })),
                );
            }
        } else {
            self.local.commit(batch).await?;
        }
        emit(
            Level::Debug,
            "save.deleted",
            &format!("Deleted slot {} for {}", key.slot, key.user),
            Some(serde_json::json!({ "id": id })),
        );
        Ok(())
    }

    fn require_cloud(&self, operation: &str) -> Result<(), RawFailure> {
        let mode = self.modes().get_mode();
        if mode.allows_cloud() {
            Ok(())
        } else {
            Err(RawFailure::coded(
                "failed-precondition",
                format!("{operation} needs cloud access but the service is {mode}"),
            ))
        }
    }

    async fn known_slots(&self, user: &UserId) -> Result<BTreeSet<u32>, RawFailure> {
        self.require_cloud("sync")?;
        let capacity = self.slot_capacity();
        let mut slots: BTreeSet<u32> = self
            .local
            .query_metadata(user, capacity)
            .await?
            .into_iter()
            .map(|m| m.slot)
            .collect();
        slots.extend(
            self.remote
                .query_metadata(user, capacity)
                .await?
                .into_iter()
                .map(|m| m.slot),
        );
        Ok(slots)
    }

    async fn sync_once(
        &self,
        user: &UserId,
        slot: u32,
        candidate: Option<&SaveRecord>,
    ) -> Result<SyncDecision, RawFailure> {
        self.require_cloud("sync")?;
        let id = SaveKey::new(user, slot).id();
        let local = match candidate {
            Some(record) => Some(record.clone()),
            None => self.local.get_record(&id).await?,
        };
        let remote = self.remote.get_record(&id).await?;

        let Some(decision) = determine_action(
            local.as_ref().map(|r| &r.metadata),
            remote.as_ref().map(|r| &r.metadata),
        ) else {
            return Err(RawFailure::coded(
                "not-found",
                format!("no save in slot {slot} for {user} on either side"),
            ));
        };

        match (decision.action, local, remote) {
            (SyncAction::Upload, Some(local), _) => {
                let synced = local.with_status(SyncStatus::Synced);
                self.remote
                    .commit(WriteBatch::new().put_record(&synced))
                    .await?;
                self.local
                    .commit(WriteBatch::new().put_record(&synced))
                    .await?;
            }
            (SyncAction::Download, _, Some(remote)) => {
                self.decode_verified(&remote)?;
                let synced = remote.with_status(SyncStatus::Synced);
                self.local
                    .commit(WriteBatch::new().put_record(&synced))
                    .await?;
            }
            // A caller-supplied copy may not be what the local store holds, so it
            // is written whole; a stored copy only needs its status flipped
            (SyncAction::Skip, Some(local), _) if candidate.is_some() => {
                self.local
                    .commit(WriteBatch::new().put_record(&local.with_status(SyncStatus::Synced)))
                    .await?;
            }
            (SyncAction::Skip, Some(local), _) if local.metadata.sync_status != SyncStatus::Synced => {
                self.local
                    .commit(WriteBatch::new().put_metadata(
                        local.with_status(SyncStatus::Synced).metadata,
                    ))
                    .await?;
            }
            (SyncAction::Conflict, Some(local), _) => {
                self.local
                    .commit(WriteBatch::new().put_record(&local.with_status(SyncStatus::Conflict)))
                    .await?;
            }
            _ => {}
        }

        emit(
            Level::Debug,
            "sync.decision",
            &format!(
                "Slot {slot}: {} ({})",
                decision.action.as_str(),
                decision.rule.as_str()
            ),
            Some(serde_json::json!({
                "user": user.as_str(),
                "slot": slot,
                "action": decision.action.as_str(),
                "rule": decision.rule.as_str(),
            })),
        );
        Ok(decision)
    }

    async fn resolve_once(
        &self,
        key: &SaveKey,
        resolution: ConflictResolution,
    ) -> Result<SaveMetadata, RawFailure> {
        self.require_cloud("resolve")?;
        let id = key.id();
        let missing = |side: &str| {
            RawFailure::coded(
                "not-found",
                format!("no {side} save in slot {} for {}", key.slot, key.user),
            )
        };

        let resolved = match resolution {
            ConflictResolution::KeepLocal => {
                let mut record = self.local.get_record(&id).await?.ok_or_else(|| missing("local"))?;
                // Newer than every other copy so other devices download it
                record.metadata.updated_at = Utc::now();
                let synced = record.with_status(SyncStatus::Synced);
                self.remote
                    .commit(WriteBatch::new().put_record(&synced))
                    .await?;
                synced
            }
            ConflictResolution::KeepRemote => {
                let record = self
                    .remote
                    .get_record(&id)
                    .await?
                    .ok_or_else(|| missing("cloud"))?;
                self.decode_verified(&record)?;
                record.with_status(SyncStatus::Synced)
            }
        };
        self.local
            .commit(WriteBatch::new().put_record(&resolved))
            .await?;

        emit(
            Level::Success,
            "sync.resolved",
            &format!(
                "Resolved conflict in slot {} by keeping the {} copy",
                key.slot,
                match resolution {
                    ConflictResolution::KeepLocal => "local",
                    ConflictResolution::KeepRemote => "cloud",
                }
            ),
            Some(serde_json::json!({ "id": id })),
        );
        Ok(resolved.metadata)
    }

    fn finish<T>(
        &self,
        operation: &str,
        user: &UserId,
        slot: Option<u32>,
        started: Instant,
        outcome: Result<T, CanonicalError>,
    ) -> OpResult<T> {
        let (data, error) = match outcome {
            Ok(data) => (Some(data), None),
            Err(error) => (None, Some(error)),
        };
        let result = OpResult {
            success: error.is_none(),
            data,
            error,
            operation: operation.to_string(),
            operation_id: new_operation_id(operation),
            timestamp: Utc::now(),
            elapsed: started.elapsed(),
        };

        if let Some(error) = &result.error {
            emit(
                Level::Warn,
                "op.failed",
                &format!("{operation} failed: {} ({})", error.message, error.code),
                Some(serde_json::json!({
                    "operation": operation,
                    "operation_id": result.operation_id,
                    "code": error.code.as_str(),
                    "severity": error.severity.as_str(),
                    "detail": error.detail,
                })),
            );
            self.events.publish(SyncEvent::Error {
                error: error.clone(),
            });
        }

        if let Some(journal) = &self.journal {
            let entry = OperationLog::from_result(&result, user, slot, self.modes().get_mode());
            if let Err(err) = journal.record(&entry) {
                emit(
                    Level::Debug,
                    "journal.write_failed",
                    &format!("Could not journal {operation}: {err:#}"),
                    None,
                );
            }
        }
        result
    }
}

fn new_operation_id(operation: &str) -> String {
    format!(
        "{operation}-{}-{:08x}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

/// Union by slot, newest copy wins
fn merge_listings(
    remote: Vec<SaveMetadata>,
    local: Vec<SaveMetadata>,
    limit: usize,
) -> Vec<SaveMetadata> {
    let mut by_slot: BTreeMap<u32, SaveMetadata> =
        remote.into_iter().map(|m| (m.slot, m)).collect();
    for save in local {
        match by_slot.get(&save.slot) {
            Some(existing) if existing.updated_at >= save.updated_at => {}
            _ => {
                by_slot.insert(save.slot, save);
            }
        }
    }
    let mut merged: Vec<SaveMetadata> = by_slot.into_values().collect();
    merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.slot.cmp(&b.slot)));
    merged.truncate(limit);
    merged
}

#[async_trait]
impl SaveListing for SaveSyncCoordinator {
    async fn list_saves(&self, user: &UserId) -> Result<Vec<SaveMetadata>, CanonicalError> {
        self.list(user).await.into_result()
    }

    async fn delete_save(&self, user: &UserId, slot: u32) -> Result<(), CanonicalError> {
        self.delete(user, slot).await.into_result()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::{DateTime, TimeZone};

    pub fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap()
    }

    pub fn record(user: &str, slot: u32, data: &[u8]) -> SaveRecord {
        record_at(user, slot, data, epoch())
    }

    pub fn record_at(user: &str, slot: u32, data: &[u8], at: DateTime<Utc>) -> SaveRecord {
        let payload = GzipCodec::default().encode(data).unwrap();
        let key = SaveKey::new(&UserId::from(user), slot);
        SaveRecord {
            metadata: SaveMetadata {
                id: key.id(),
                user: key.user,
                slot,
                name: format!("Slot {slot}"),
                payload: payload.info.clone(),
                created_at: at,
                updated_at: at,
                last_played_at: None,
                sync_status: SyncStatus::Synced,
            },
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::recovery::ManualProbe;
    use crate::retry::ErrorClassifier;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    struct Harness {
        coordinator: SaveSyncCoordinator,
        remote: Arc<MemoryStore>,
        local: Arc<MemoryStore>,
        probe: Arc<ManualProbe>,
        events: EventBus,
    }

    fn quick_policies() -> RetryPolicies {
        let fast = RetryPolicy::new(3, StdDuration::from_millis(1), StdDuration::from_millis(4), 2.0);
        RetryPolicies {
            network: fast.clone(),
            critical: fast.clone(),
            background: fast.clone(),
            quick: fast,
        }
    }

    fn harness() -> Harness {
        harness_with(quick_policies(), 3)
    }

    fn harness_with(policies: RetryPolicies, recovery_attempts: u32) -> Harness {
        let events = EventBus::default();
        let probe = Arc::new(ManualProbe::default());
        let modes = Arc::new(ServiceModeController::new(probe.clone(), events.clone()));
        let settings = RecoverySettings {
            max_attempts: recovery_attempts,
            connectivity_poll_ms: 1,
            connectivity_polls: 2,
        };
        let recovery = Arc::new(RecoveryCoordinator::with_default_strategies(
            ErrorClassifier::default(),
            modes,
            probe.clone(),
            events.clone(),
            &settings,
        ));
        let remote = Arc::new(MemoryStore::new("remote"));
        let local = Arc::new(MemoryStore::new("local"));
        let coordinator = SaveSyncCoordinator::new(
            remote.clone(),
            local.clone(),
            Arc::new(GzipCodec::default()),
            recovery,
            events.clone(),
        )
        .with_policies(policies)
        .with_recovery_attempts(recovery_attempts);
        Harness {
            coordinator,
            remote,
            local,
            probe,
            events,
        }
    }

    fn ada() -> UserId {
        UserId::from("ada")
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let h = harness();
        let saved = h
            .coordinator
            .save(&ada(), 2, "Dragon cave", b"{\"hp\":12}")
            .await;
        assert!(saved.success);
        let meta = saved.data.unwrap();
        assert_eq!(meta.sync_status, SyncStatus::Synced);
        assert_eq!(meta.name, "Dragon cave");
        assert_eq!(h.remote.metadata_count(), 1);
        assert_eq!(h.local.metadata_count(), 1);

        let loaded = h.coordinator.load(&ada(), 2).await.into_result().unwrap();
        assert_eq!(loaded.data, b"{\"hp\":12}");
        assert!(!h.coordinator.load(&ada(), 2).await.operation_id.is_empty());
    }

    #[tokio::test]
    async fn test_resave_keeps_creation_time() {
        let h = harness();
        let first = h.coordinator.save(&ada(), 1, "", b"a").await.data.unwrap();
        let second = h.coordinator.save(&ada(), 1, "", b"b").await.data.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.name, "Slot 1");
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_slot_and_size() {
        let h = harness();
        let result = h.coordinator.save(&ada(), 0, "x", b"a").await;
        assert!(!result.success);
        assert!(!result.error.unwrap().retryable);

        let huge = vec![0u8; (h.coordinator.limits().max_payload_bytes + 1) as usize];
        let result = h.coordinator.save(&ada(), 1, "x", &huge).await;
        assert!(!result.success);
        assert_eq!(h.remote.metadata_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_commit_failure_is_retried_atomically() {
        let h = harness();
        // First attempt dies between the metadata and payload writes
        h.remote.fail_point().fail_after(1);
        let result = h.coordinator.save(&ada(), 3, "x", b"gold: 40").await;
        assert!(result.success);
        assert_eq!(h.remote.metadata_count(), 1);
        assert_eq!(h.remote.payload_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_save_degrades_to_local_pending() {
        let h = harness();
        h.remote.set_available(false);
        h.probe.set_online(false);

        let result = h.coordinator.save(&ada(), 1, "x", b"offline progress").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.data.unwrap().sync_status, SyncStatus::Pending);
        assert_eq!(h.coordinator.modes().get_mode(), ServiceMode::Offline);
        assert!(h.coordinator.recovery().is_fallback_mode());
        assert_eq!(h.remote.metadata_count(), 0);

        // Still readable while offline
        let loaded = h.coordinator.load(&ada(), 1).await.into_result().unwrap();
        assert_eq!(loaded.data, b"offline progress");
    }

    #[tokio::test]
    async fn test_restore_then_sync_uploads_pending() {
        let h = harness();
        h.remote.set_available(false);
        h.probe.set_online(false);
        h.coordinator.save(&ada(), 1, "x", b"offline").await;

        assert!(!h.coordinator.restore_cloud().await);
        h.remote.set_available(true);
        h.probe.set_online(true);
        assert!(h.coordinator.restore_cloud().await);
        assert!(!h.coordinator.recovery().is_fallback_mode());

        let report = h.coordinator.sync_all(&ada()).await.into_result().unwrap();
        assert_eq!(report.count(SyncAction::Upload), 1);
        let remote = h.remote.get_metadata("ada_1").await.unwrap().unwrap();
        assert_eq!(remote.sync_status, SyncStatus::Synced);
        let local = h.local.get_metadata("ada_1").await.unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_sync_downloads_newer_remote() {
        let h = harness();
        let t = fixtures::epoch();
        let local = fixtures::record_at("ada", 1, b"old", t - Duration::milliseconds(1000));
        let remote = fixtures::record_at("ada", 1, b"new", t);
        h.local.commit(WriteBatch::new().put_record(&local)).await.unwrap();
        h.remote.commit(WriteBatch::new().put_record(&remote)).await.unwrap();

        let result = h.coordinator.sync_slot(&ada(), 1, None).await;
        let decision = result.into_result().unwrap();
        assert_eq!(decision.action, SyncAction::Download);
        assert_eq!(decision.rule, SyncRule::RemoteNewer);
        let now_local = h.local.get_record("ada_1").await.unwrap().unwrap();
        assert_eq!(now_local.checksum(), remote.checksum());
    }

    #[tokio::test]
    async fn test_sync_conflict_is_surfaced_with_decision() {
        let h = harness();
        let mut rx = h.events.subscribe();
        let local = fixtures::record("ada", 1, b"mine");
        let remote = fixtures::record("ada", 1, b"theirs");
        h.remote.commit(WriteBatch::new().put_record(&remote)).await.unwrap();

        let result = h.coordinator.sync_slot(&ada(), 1, Some(local)).await;
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::SyncConflict);
        assert_eq!(result.data.as_ref().unwrap().rule, SyncRule::ChecksumDiverged);
        let status = h.local.get_metadata("ada_1").await.unwrap().unwrap().sync_status;
        assert_eq!(status, SyncStatus::Conflict);

        let mut saw_conflict = false;
        while let Ok(event) = rx.try_recv() {
            saw_conflict |= matches!(event, SyncEvent::ConflictDetected { slot: 1, .. });
        }
        assert!(saw_conflict);

        let resolved = h
            .coordinator
            .resolve_conflict(&ada(), 1, ConflictResolution::KeepLocal)
            .await
            .into_result()
            .unwrap();
        assert_eq!(resolved.sync_status, SyncStatus::Synced);
        let remote_now = h.remote.get_record("ada_1").await.unwrap().unwrap();
        assert_eq!(remote_now.checksum(), resolved.payload.checksum);
        assert!(remote_now.updated_at() > fixtures::epoch());
    }

    #[tokio::test]
    async fn test_sync_requires_cloud_mode() {
        let h = harness();
        h.coordinator
            .modes()
            .degrade_to_mode(ServiceMode::LocalOnly, "test");
        let result = h.coordinator.sync_slot(&ada(), 1, None).await;
        assert!(!result.success);
        assert!(!result.error.unwrap().retryable);
    }

    #[tokio::test]
    async fn test_load_rejects_tampered_payload() {
        let h = harness();
        let mut record = fixtures::record("ada", 1, b"real");
        record.metadata.payload.checksum = "0".repeat(64);
        h.remote.commit(WriteBatch::new().put_record(&record)).await.unwrap();

        let err = h.coordinator.load(&ada(), 1).await.into_result().unwrap_err();
        assert_eq!(err.code, ErrorCode::DataChecksumMismatch);
    }

    #[tokio::test]
    async fn test_list_merges_newer_local_copies() {
        let h = harness();
        let t = fixtures::epoch();
        let remote_old = fixtures::record_at("ada", 1, b"r1", t);
        let local_new = fixtures::record_at("ada", 1, b"l1", t + Duration::minutes(5));
        let remote_only = fixtures::record_at("ada", 2, b"r2", t + Duration::minutes(1));
        h.remote
            .commit(WriteBatch::new().put_record(&remote_old).put_record(&remote_only))
            .await
            .unwrap();
        h.local.commit(WriteBatch::new().put_record(&local_new)).await.unwrap();

        let listed = h.coordinator.list(&ada()).await.into_result().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].slot, 1);
        assert_eq!(listed[0].payload.checksum, local_new.checksum());
        assert_eq!(listed[1].slot, 2);
    }

    #[tokio::test]
    async fn test_delete_removes_both_copies() {
        let h = harness();
        h.coordinator.save(&ada(), 4, "x", b"bye").await;
        assert!(h.coordinator.delete(&ada(), 4).await.success);
        assert_eq!(h.remote.metadata_count(), 0);
        assert_eq!(h.local.metadata_count(), 0);
        let missing = h.coordinator.load(&ada(), 4).await;
        assert!(!missing.success);
    }

    #[tokio::test]
    async fn test_skip_with_pending_candidate_writes_whole_record() {
        let h = harness();
        let t = fixtures::epoch();
        let stale = fixtures::record_at("ada", 1, b"old", t - Duration::seconds(5));
        let current = fixtures::record_at("ada", 1, b"same", t);
        h.local.commit(WriteBatch::new().put_record(&stale)).await.unwrap();
        h.remote.commit(WriteBatch::new().put_record(&current)).await.unwrap();

        let candidate = current.clone().with_status(SyncStatus::Pending);
        let decision = h
            .coordinator
            .sync_slot(&ada(), 1, Some(candidate))
            .await
            .into_result()
            .unwrap();
        assert_eq!(decision.action, SyncAction::Skip);

        let stored = h.local.get_record("ada_1").await.unwrap().unwrap();
        assert_eq!(stored.checksum(), current.checksum());
        assert_eq!(stored.metadata.sync_status, SyncStatus::Synced);

        h.coordinator
            .modes()
            .degrade_to_mode(ServiceMode::LocalOnly, "test");
        let loaded = h.coordinator.load(&ada(), 1).await.into_result().unwrap();
        assert_eq!(loaded.data, b"same");
    }

    #[tokio::test]
    async fn test_skip_with_candidate_fills_empty_local_slot() {
        let h = harness();
        let current = fixtures::record("ada", 2, b"same");
        h.remote.commit(WriteBatch::new().put_record(&current)).await.unwrap();

        let candidate = current.clone().with_status(SyncStatus::Pending);
        assert!(h.coordinator.sync_slot(&ada(), 2, Some(candidate)).await.success);
        assert_eq!(h.local.metadata_count(), 1);
        assert_eq!(h.local.payload_count(), 1);
        assert!(h.local.get_record("ada_2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_sync_flags_local_copy() {
        let h = harness();
        let t = fixtures::epoch();
        let local = fixtures::record_at("ada", 1, b"mine", t - Duration::seconds(5));
        let mut remote = fixtures::record_at("ada", 1, b"theirs", t);
        remote.metadata.payload.checksum = "0".repeat(64);
        h.local.commit(WriteBatch::new().put_record(&local)).await.unwrap();
        h.remote.commit(WriteBatch::new().put_record(&remote)).await.unwrap();

        let result = h.coordinator.sync_slot(&ada(), 1, None).await;
        assert_eq!(result.error.unwrap().code, ErrorCode::DataChecksumMismatch);

        let flagged = h.local.get_record("ada_1").await.unwrap().unwrap();
        assert_eq!(flagged.metadata.sync_status, SyncStatus::Error);
        assert_eq!(flagged.checksum(), local.checksum());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_both_halves() {
        let once = RetryPolicy::new(1, StdDuration::from_millis(1), StdDuration::from_millis(1), 2.0);
        let policies = RetryPolicies {
            network: once.clone(),
            critical: once.clone(),
            background: once.clone(),
            quick: once,
        };
        let h = harness_with(policies, 1);
        assert!(h.coordinator.save(&ada(), 4, "x", b"keep me").await.success);

        // Metadata row goes, then the payload delete fails
        h.remote.fail_point().fail_after(1);
        let result = h.coordinator.delete(&ada(), 4).await;
        assert!(!result.success);
        assert_eq!(h.remote.metadata_count(), 1);
        assert_eq!(h.remote.payload_count(), 1);
        assert_eq!(h.local.metadata_count(), 1);

        let loaded = h.coordinator.load(&ada(), 4).await.into_result().unwrap();
        assert_eq!(loaded.data, b"keep me");
    }

    #[tokio::test]
    async fn test_interrupted_delete_is_retried_whole() {
        let h = harness();
        h.coordinator.save(&ada(), 4, "x", b"bye").await;
        h.remote.fail_point().fail_after(1);
        assert!(h.coordinator.delete(&ada(), 4).await.success);
        assert!(!h.remote.fail_point().is_armed());
        assert_eq!(h.remote.metadata_count(), 0);
        assert_eq!(h.remote.payload_count(), 0);
    }
}
