use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use super::probe::ConnectivityProbe;
use crate::events::{EventBus, SyncEvent};
use crate::ui::prelude::*;

/// How much of the cloud functionality is currently available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    CloudEnabled,
    LocalOnly,
    /// Cloud reachable but unreliable; behaves like `LocalOnly`
    Degraded,
    Offline,
}

impl ServiceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceMode::CloudEnabled => "cloud_enabled",
            ServiceMode::LocalOnly => "local_only",
            ServiceMode::Degraded => "degraded",
            ServiceMode::Offline => "offline",
        }
    }

    pub fn allows_cloud(self) -> bool {
        matches!(self, ServiceMode::CloudEnabled)
    }
}

impl std::fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeTransition {
    pub from: ServiceMode,
    pub to: ServiceMode,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct ModeState {
    mode: ServiceMode,
    last_transition: Option<ModeTransition>,
}

/// Holds the active [`ServiceMode`] for the lifetime of the process.
///
/// Transitions are last-write-wins; the controller never refuses one.
pub struct ServiceModeController {
    state: RwLock<ModeState>,
    probe: Arc<dyn ConnectivityProbe>,
    events: EventBus,
}

impl ServiceModeController {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, events: EventBus) -> Self {
        Self {
            state: RwLock::new(ModeState {
                mode: ServiceMode::CloudEnabled,
                last_transition: None,
            }),
            probe,
            events,
        }
    }

    pub fn get_mode(&self) -> ServiceMode {
        match self.state.read() {
            Ok(state) => state.mode,
            Err(poisoned) => poisoned.into_inner().mode,
        }
    }

    pub fn is_cloud_enabled(&self) -> bool {
        self.get_mode().allows_cloud()
    }

    pub fn last_transition(&self) -> Option<ModeTransition> {
        match self.state.read() {
            Ok(state) => state.last_transition.clone(),
            Err(poisoned) => poisoned.into_inner().last_transition.clone(),
        }
    }

    /// Switch to `mode`, typically back to `CloudEnabled` after a successful restoration probe
    pub fn set_mode(&self, mode: ServiceMode, reason: &str) {
        if let Some(transition) = self.transition(mode, reason) {
            let (code, level) = if mode.allows_cloud() {
                ("mode.restored", Level::Success)
            } else {
                ("mode.changed", Level::Info)
            };
            emit(
                level,
                code,
                &format!("Service mode {} -> {}: {reason}", transition.from, mode),
                Some(serde_json::json!({
                    "from": transition.from.as_str(),
                    "to": mode.as_str(),
                    "reason": reason,
                })),
            );
        }
    }

    /// Drop to a reduced mode. Always succeeds and records the reason.
    pub fn degrade_to_mode(&self, mode: ServiceMode, reason: &str) {
        if let Some(transition) = self.transition(mode, reason) {
            emit(
                Level::Warn,
                "mode.degraded",
                &format!("Cloud saves degraded to {mode}: {reason}"),
                Some(serde_json::json!({
                    "from": transition.from.as_str(),
                    "to": mode.as_str(),
                    "reason": reason,
                })),
            );
        }
    }

    /// Check whether conditions allow returning to `CloudEnabled`.
    ///
    /// Does not change the mode; the caller decides whether to call [`Self::set_mode`].
    pub async fn attempt_restoration(&self) -> bool {
        let online = self.probe.is_online().await;
        let authenticated = online && self.probe.is_authenticated().await;
        let ready = online && authenticated;
        emit(
            Level::Debug,
            "mode.restoration_probe",
            &format!("Restoration probe: online={online} authenticated={authenticated}"),
            Some(serde_json::json!({
                "online": online,
                "authenticated": authenticated,
                "current_mode": self.get_mode().as_str(),
            })),
        );
        ready
    }

    fn transition(&self, mode: ServiceMode, reason: &str) -> Option<ModeTransition> {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let from = state.mode;
        let transition = ModeTransition {
            from,
            to: mode,
            reason: reason.to_string(),
            at: Utc::now(),
        };
        state.mode = mode;
        state.last_transition = Some(transition.clone());
        drop(state);

        if from == mode {
            return None;
        }
        self.events.publish(SyncEvent::ModeChanged {
            from,
            to: mode,
            reason: reason.to_string(),
        });
        Some(transition)
    }
}
