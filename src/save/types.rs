use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CanonicalError, ErrorCode};
use crate::identity::UserId;

/// Composite identity of a save: one record per (user, slot)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SaveKey {
    pub user: UserId,
    pub slot: u32,
}

impl SaveKey {
    pub fn new(user: &UserId, slot: u32) -> Self {
        Self {
            user: user.clone(),
            slot,
        }
    }

    pub fn id(&self) -> String {
        format!("{}_{}", self.user, self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "conflict" => Some(SyncStatus::Conflict),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec output describing a stored payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadInfo {
    /// SHA-256 of the uncompressed bytes, lowercase hex
    pub checksum: String,
    pub algorithm: String,
    pub original_size: u64,
    pub compressed_size: u64,
}

/// Everything about a save except its payload bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveMetadata {
    pub id: String,
    pub user: UserId,
    pub slot: u32,
    pub name: String,
    pub payload: PayloadInfo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_played_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
}

impl SaveMetadata {
    pub fn key(&self) -> SaveKey {
        SaveKey::new(&self.user, self.slot)
    }

    /// Most recent sign of use, for picking cleanup victims
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_played_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub data: Vec<u8>,
    pub info: PayloadInfo,
}

/// A complete save as exchanged between the local and remote stores
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRecord {
    pub metadata: SaveMetadata,
    pub payload: StoredPayload,
}

impl SaveRecord {
    pub fn key(&self) -> SaveKey {
        self.metadata.key()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.metadata.updated_at
    }

    pub fn checksum(&self) -> &str {
        &self.metadata.payload.checksum
    }

    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.metadata.sync_status = status;
        self
    }
}

/// A save read back and decompressed
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSave {
    pub metadata: SaveMetadata,
    pub data: Vec<u8>,
}

/// Uniform result of every coordinator operation
#[derive(Debug, Clone)]
pub struct OpResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<CanonicalError>,
    pub operation: String,
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed: Duration,
}

impl<T> OpResult<T> {
    pub fn into_result(self) -> Result<T, CanonicalError> {
        match (self.data, self.error) {
            (_, Some(error)) => Err(error),
            (Some(data), None) => Ok(data),
            (None, None) => Err(CanonicalError::from_classification(
                ErrorCode::Unknown,
                false,
                format!("{} produced no result", self.operation),
            )),
        }
    }
}

/// How to settle a slot left in `conflict`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepLocal,
    KeepRemote,
}

/// Bounds enforced before anything is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveLimits {
    pub min_slot: u32,
    pub max_slot: u32,
    pub max_payload_bytes: u64,
    /// Cap on saves returned by `list` and kept per user
    pub max_saves: usize,
}

impl Default for SaveLimits {
    fn default() -> Self {
        Self {
            min_slot: 1,
            max_slot: 10,
            max_payload_bytes: 5 * 1024 * 1024,
            max_saves: 10,
        }
    }
}

impl SaveLimits {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_slot > self.max_slot {
            anyhow::bail!("limits: min_slot must not exceed max_slot");
        }
        if self.max_payload_bytes == 0 {
            anyhow::bail!("limits: max_payload_bytes must be positive");
        }
        if self.max_saves == 0 {
            anyhow::bail!("limits: max_saves must be positive");
        }
        Ok(())
    }
}
