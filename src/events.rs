//! Broadcast channel for everything observers may want to react to:
//! mode changes, quota notifications, surfaced errors and conflicts.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{CanonicalError, Severity};
use crate::identity::UserId;
use crate::quota::{QuotaLevel, QuotaNotification, QuotaStatus};
use crate::recovery::ServiceMode;
use crate::save::SyncDecision;

const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    ModeChanged {
        from: ServiceMode,
        to: ServiceMode,
        reason: String,
    },
    Message {
        message: String,
        severity: Severity,
    },
    Error {
        error: CanonicalError,
    },
    QuotaLevelChanged {
        previous: Option<QuotaLevel>,
        status: Box<QuotaStatus>,
    },
    Notification {
        notification: QuotaNotification,
    },
    CleanupCompleted {
        user: UserId,
        deleted: usize,
        bytes_freed: u64,
    },
    ConflictDetected {
        user: UserId,
        slot: u32,
        decision: SyncDecision,
    },
}

/// Multi-subscriber event channel. Publishing never fails; events sent while
/// nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    pub fn notify(&self, message: impl Into<String>, severity: Severity) {
        self.publish(SyncEvent::Message {
            message: message.into(),
            severity,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
