//! Storage quota monitoring with threshold notifications and optional cleanup.

mod cleanup;
mod types;

pub use cleanup::select_victims;
pub use types::{
    NotificationAction, NotificationKind, QuotaLevel, QuotaNotification, QuotaSettings,
    QuotaStatus, SlotUsage,
};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{CanonicalError, Severity};
use crate::events::{EventBus, SyncEvent};
use crate::identity::UserId;
use crate::save::SaveMetadata;
use crate::ui::prelude::*;

/// Read access to a user's saves, plus deletion for cleanup
#[async_trait]
pub trait SaveListing: Send + Sync {
    async fn list_saves(&self, user: &UserId) -> Result<Vec<SaveMetadata>, CanonicalError>;

    async fn delete_save(&self, user: &UserId, slot: u32) -> Result<(), CanonicalError>;
}

#[derive(Debug, Default)]
struct QuotaState {
    last_status: Option<QuotaStatus>,
    notifications: VecDeque<QuotaNotification>,
}

// Clears the in-flight flag even when the check is aborted
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct QuotaMonitor {
    listing: Arc<dyn SaveListing>,
    settings: QuotaSettings,
    events: EventBus,
    state: Mutex<QuotaState>,
    monitoring: AtomicBool,
    in_flight: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    // Bumped by every start; a start that is no longer the latest spawns nothing
    generation: AtomicU64,
    next_notification: AtomicU64,
}

impl QuotaMonitor {
    pub fn new(listing: Arc<dyn SaveListing>, settings: QuotaSettings, events: EventBus) -> Self {
        Self {
            listing,
            settings,
            events,
            state: Mutex::new(QuotaState::default()),
            monitoring: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            task: Mutex::new(None),
            generation: AtomicU64::new(0),
            next_notification: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &QuotaSettings {
        &self.settings
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    /// Check now, then every `check_interval_secs` until [`Self::stop_monitoring`].
    /// Calling it while already monitoring does nothing.
    pub async fn start_monitoring(self: &Arc<Self>, user: &UserId) {
        if self.monitoring.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        emit(
            Level::Debug,
            "quota.monitor_started",
            &format!(
                "Monitoring storage for {user} every {}s",
                self.settings.check_interval_secs
            ),
            None,
        );

        self.tick(user).await;

        let period = Duration::from_secs(self.settings.check_interval_secs.max(1));
        let monitor: Weak<Self> = Arc::downgrade(self);
        let user = user.clone();

        let mut task = lock(&self.task);
        // stop_monitoring (and maybe a newer start) may have run during the first check
        if !self.is_monitoring() || self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.tick(&user).await;
            }
        });
        if let Some(stale) = task.replace(handle) {
            stale.abort();
        }
    }

    pub fn stop_monitoring(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
            emit(
                Level::Debug,
                "quota.monitor_stopped",
                "Stopped storage monitoring",
                None,
            );
        }
    }

    async fn tick(&self, user: &UserId) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            emit(
                Level::Debug,
                "quota.check_skipped",
                "Previous quota check still running",
                None,
            );
            return;
        }
        let _in_flight = InFlight(&self.in_flight);
        self.check_quota(user).await;
    }

    /// Compute current usage. Never fails: when saves cannot be listed the
    /// last known status (or an empty one) is returned instead.
    pub async fn check_quota(&self, user: &UserId) -> QuotaStatus {
        let saves = match self.listing.list_saves(user).await {
            Ok(saves) => saves,
            Err(error) => {
                emit(
                    Level::Warn,
                    "quota.check_failed",
                    &format!("Could not read storage usage: {}", error.message),
                    Some(serde_json::json!({
                        "code": error.code.as_str(),
                        "detail": error.detail,
                    })),
                );
                return match self.current_status() {
                    Some(last) => last,
                    None => QuotaStatus::unknown(self.settings.max_bytes, error.code.as_str()),
                };
            }
        };

        let status = self.compute_status(&saves);
        self.record_status(user, &status);

        if status.level == QuotaLevel::Exceeded && self.settings.auto_cleanup {
            self.auto_cleanup(user, &saves).await;
        }
        status
    }

    pub fn current_status(&self) -> Option<QuotaStatus> {
        lock(&self.state).last_status.clone()
    }

    /// Newest first
    pub fn get_notifications(&self) -> Vec<QuotaNotification> {
        lock(&self.state)
            .notifications
            .iter()
            .rev()
            .cloned()
            .collect()
    }

    pub fn mark_notification_read(&self, id: &str) -> bool {
        let mut state = lock(&self.state);
        match state.notifications.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.state)
            .notifications
            .iter()
            .filter(|n| !n.read)
            .count()
    }

    pub fn clear_notifications(&self) {
        lock(&self.state).notifications.clear();
    }

    fn compute_status(&self, saves: &[SaveMetadata]) -> QuotaStatus {
        let max_bytes = self.settings.max_bytes;
        let used_bytes: u64 = saves.iter().map(|s| s.payload.compressed_size).sum();
        let usage_percentage = if max_bytes == 0 {
            100
        } else {
            (used_bytes as f64 / max_bytes as f64 * 100.0).round() as u32
        };
        let level = self.settings.level_for(usage_percentage);
        let message = match level {
            QuotaLevel::Normal => format!("Using {usage_percentage}% of your save storage."),
            QuotaLevel::Warning => {
                format!("Save storage is {usage_percentage}% full. Consider deleting old saves.")
            }
            QuotaLevel::Critical => format!(
                "Save storage is almost full ({usage_percentage}%). New saves may fail soon."
            ),
            QuotaLevel::Exceeded => {
                "Save storage is full. Delete a save to keep saving to the cloud.".to_string()
            }
        };

        QuotaStatus {
            used_bytes,
            max_bytes,
            usage_percentage,
            available_bytes: max_bytes.saturating_sub(used_bytes),
            total_saves: saves.len(),
            level,
            message,
            last_checked: Utc::now(),
            slots: saves
                .iter()
                .map(|s| SlotUsage {
                    slot: s.slot,
                    name: s.name.clone(),
                    size: s.payload.compressed_size,
                    created_at: s.created_at,
                    last_played_at: s.last_played_at,
                })
                .collect(),
        }
    }

    fn record_status(&self, user: &UserId, status: &QuotaStatus) {
        let previous = lock(&self.state).last_status.replace(status.clone());

        let changed = match &previous {
            None => status.level != QuotaLevel::Normal,
            Some(prev) => {
                prev.level != status.level
                    || prev.usage_percentage.abs_diff(status.usage_percentage)
                        >= self.settings.significant_change_points
            }
        };
        if !changed {
            return;
        }

        let previous_level = previous.as_ref().map(|p| p.level);
        let level = match status.level {
            QuotaLevel::Critical | QuotaLevel::Exceeded => Level::Warn,
            _ => Level::Info,
        };
        emit(
            level,
            "quota.level_changed",
            &status.message,
            Some(serde_json::json!({
                "user": user.as_str(),
                "level": status.level.as_str(),
                "previous": previous_level.map(QuotaLevel::as_str),
                "usage_percentage": status.usage_percentage,
                "used_bytes": status.used_bytes,
            })),
        );
        self.events.publish(SyncEvent::QuotaLevelChanged {
            previous: previous_level,
            status: Box::new(status.clone()),
        });

        let notification = match status.level {
            QuotaLevel::Warning => Some((
                NotificationKind::Warning,
                "Storage getting full",
                vec![NotificationAction::new("Manage saves", "manage_saves")],
            )),
            QuotaLevel::Critical => Some((
                NotificationKind::Critical,
                "Storage almost full",
                vec![
                    NotificationAction::new("Delete old saves", "cleanup"),
                    NotificationAction::new("Manage saves", "manage_saves"),
                ],
            )),
            QuotaLevel::Exceeded => Some((
                NotificationKind::Exceeded,
                "Storage full",
                vec![
                    NotificationAction::new("Delete old saves", "cleanup"),
                    NotificationAction::new("Manage saves", "manage_saves"),
                ],
            )),
            QuotaLevel::Normal => match previous_level {
                Some(prev) if prev != QuotaLevel::Normal => Some((
                    NotificationKind::Recovered,
                    "Storage back to normal",
                    Vec::new(),
                )),
                _ => None,
            },
        };
        if let Some((kind, title, actions)) = notification {
            self.push_notification(kind, title, &status.message, actions);
        }
    }

    async fn auto_cleanup(&self, user: &UserId, saves: &[SaveMetadata]) {
        let victims = select_victims(saves, self.settings.max_saves_to_keep);
        if victims.is_empty() {
            emit(
                Level::Debug,
                "quota.cleanup_skipped",
                &format!(
                    "Storage full but only {} save(s) exist, keeping them all",
                    saves.len()
                ),
                None,
            );
            return;
        }

        let mut deleted = 0usize;
        let mut bytes_freed = 0u64;
        let mut failures = Vec::new();
        for victim in victims {
            match self.listing.delete_save(user, victim.slot).await {
                Ok(()) => {
                    deleted += 1;
                    bytes_freed += victim.payload.compressed_size;
                }
                Err(error) => failures.push(format!("slot {}: {}", victim.slot, error.code)),
            }
        }

        if deleted > 0 {
            emit(
                Level::Success,
                "quota.cleanup_completed",
                &format!("Removed {deleted} old save(s), freed {bytes_freed} bytes"),
                Some(serde_json::json!({
                    "user": user.as_str(),
                    "deleted": deleted,
                    "bytes_freed": bytes_freed,
                })),
            );
            self.events.publish(SyncEvent::CleanupCompleted {
                user: user.clone(),
                deleted,
                bytes_freed,
            });
            self.push_notification(
                NotificationKind::CleanupCompleted,
                "Old saves removed",
                &format!("{deleted} old save(s) were removed to free up space."),
                Vec::new(),
            );
        }

        if !failures.is_empty() {
            emit(
                Level::Error,
                "quota.cleanup_failed",
                &format!("Automatic cleanup failed for {}", failures.join(", ")),
                Some(serde_json::json!({ "user": user.as_str(), "failures": failures })),
            );
            self.events
                .notify("Some old saves could not be removed.", Severity::Medium);
            self.push_notification(
                NotificationKind::CleanupFailed,
                "Cleanup failed",
                "Some old saves could not be removed. Please delete a save manually.",
                vec![NotificationAction::new("Manage saves", "manage_saves")],
            );
        }
    }

    fn push_notification(
        &self,
        kind: NotificationKind,
        title: &str,
        message: &str,
        actions: Vec<NotificationAction>,
    ) {
        let seq = self.next_notification.fetch_add(1, Ordering::SeqCst);
        let notification = QuotaNotification {
            id: format!("quota-{}-{seq}", Utc::now().timestamp_millis()),
            kind,
            title: title.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            read: false,
            actions,
        };

        {
            let mut state = lock(&self.state);
            state.notifications.push_back(notification.clone());
            while state.notifications.len() > self.settings.notification_history.max(1) {
                state.notifications.pop_front();
            }
        }
        self.events
            .publish(SyncEvent::Notification { notification });
    }
}

impl Drop for QuotaMonitor {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
