use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::SaveMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Upload,
    Download,
    Skip,
    Conflict,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::Upload => "upload",
            SyncAction::Download => "download",
            SyncAction::Skip => "skip",
            SyncAction::Conflict => "conflict",
        }
    }
}

/// Which comparison produced the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncRule {
    LocalNewer,
    RemoteNewer,
    IdenticalChecksum,
    ChecksumDiverged,
    RemoteMissing,
    LocalMissing,
}

impl SyncRule {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncRule::LocalNewer => "local-newer",
            SyncRule::RemoteNewer => "remote-newer",
            SyncRule::IdenticalChecksum => "identical-checksum",
            SyncRule::ChecksumDiverged => "checksum-diverged",
            SyncRule::RemoteMissing => "remote-missing",
            SyncRule::LocalMissing => "local-missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDecision {
    pub action: SyncAction,
    pub rule: SyncRule,
    pub local_updated_at: Option<DateTime<Utc>>,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

/// Decide how to reconcile one slot. `None` when neither side has a save.
///
/// Timestamps decide first; checksums only break exact ties. Equal timestamps
/// with different contents are never resolved automatically.
pub fn determine_action(
    local: Option<&SaveMetadata>,
    remote: Option<&SaveMetadata>,
) -> Option<SyncDecision> {
    let local_updated_at = local.map(|m| m.updated_at);
    let remote_updated_at = remote.map(|m| m.updated_at);

    let (action, rule) = match (local, remote) {
        (None, None) => return None,
        (Some(_), None) => (SyncAction::Upload, SyncRule::RemoteMissing),
        (None, Some(_)) => (SyncAction::Download, SyncRule::LocalMissing),
        (Some(local), Some(remote)) => {
            if remote.updated_at > local.updated_at {
                (SyncAction::Download, SyncRule::RemoteNewer)
            } else if local.updated_at > remote.updated_at {
                (SyncAction::Upload, SyncRule::LocalNewer)
            } else if local.payload.checksum == remote.payload.checksum {
                (SyncAction::Skip, SyncRule::IdenticalChecksum)
            } else {
                (SyncAction::Conflict, SyncRule::ChecksumDiverged)
            }
        }
    };

    Some(SyncDecision {
        action,
        rule,
        local_updated_at,
        remote_updated_at,
    })
}
