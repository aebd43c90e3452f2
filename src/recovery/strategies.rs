//! Stock recovery strategies.
//!
//! Data integrity codes (`data-corrupted`, `data-checksum-mismatch`) and
//! `sync-conflict` intentionally get nothing here: they are surfaced to the caller.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{
    ConnectivityProbe, RecoveryContext, RecoveryCoordinator, RecoverySettings, RecoveryStrategy,
    ServiceMode, ServiceModeController,
};
use crate::error::{ErrorCode, RawFailure, Severity};
use crate::events::EventBus;

pub fn register_defaults(
    coordinator: &mut RecoveryCoordinator,
    modes: Arc<ServiceModeController>,
    probe: Arc<dyn ConnectivityProbe>,
    events: EventBus,
    settings: &RecoverySettings,
) {
    let wait_offline: Arc<dyn RecoveryStrategy> = Arc::new(WaitForConnectivity::new(
        Arc::clone(&probe),
        Arc::clone(&modes),
        ServiceMode::Offline,
        settings.poll_interval(),
        settings.connectivity_polls,
    ));
    let wait_degraded: Arc<dyn RecoveryStrategy> = Arc::new(WaitForConnectivity::new(
        Arc::clone(&probe),
        Arc::clone(&modes),
        ServiceMode::Degraded,
        settings.poll_interval(),
        settings.connectivity_polls,
    ));
    coordinator.register_strategy(ErrorCode::NetworkUnavailable, wait_offline);
    coordinator.register_strategy(ErrorCode::NetworkError, Arc::clone(&wait_degraded));
    coordinator.register_strategy(ErrorCode::OperationTimeout, wait_degraded);

    let refresh: Arc<dyn RecoveryStrategy> = Arc::new(RefreshSession::new(
        Arc::clone(&probe),
        Arc::clone(&modes),
        events.clone(),
    ));
    coordinator.register_strategy(ErrorCode::AuthRequired, Arc::clone(&refresh));
    coordinator.register_strategy(ErrorCode::AuthExpired, refresh);

    coordinator.register_strategy(
        ErrorCode::AuthInvalid,
        Arc::new(DegradeToLocal::new(
            Arc::clone(&modes),
            events.clone(),
            "account cannot access cloud saves",
            "Your saves are kept on this device until you sign in with another account.",
        )),
    );
    coordinator.register_strategy(
        ErrorCode::StorageQuotaExceeded,
        Arc::new(DegradeToLocal::new(
            modes,
            events,
            "cloud storage quota exceeded",
            "Cloud storage is full. New saves are kept on this device for now.",
        )),
    );
}

/// Poll connectivity until it comes back; otherwise drop to a reduced mode
pub struct WaitForConnectivity {
    probe: Arc<dyn ConnectivityProbe>,
    modes: Arc<ServiceModeController>,
    fallback_mode: ServiceMode,
    poll_interval: Duration,
    polls: u32,
}

impl WaitForConnectivity {
    pub fn new(
        probe: Arc<dyn ConnectivityProbe>,
        modes: Arc<ServiceModeController>,
        fallback_mode: ServiceMode,
        poll_interval: Duration,
        polls: u32,
    ) -> Self {
        Self {
            probe,
            modes,
            fallback_mode,
            poll_interval,
            polls,
        }
    }
}

#[async_trait]
impl RecoveryStrategy for WaitForConnectivity {
    fn name(&self) -> &str {
        "wait-for-connectivity"
    }

    fn description(&self) -> &str {
        "Wait for the network to come back before retrying"
    }

    async fn execute(&self, _ctx: &RecoveryContext) -> Result<bool, RawFailure> {
        for poll in 0..self.polls.max(1) {
            if self.probe.is_online().await {
                return Ok(true);
            }
            if poll + 1 < self.polls {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Ok(false)
    }

    fn has_fallback(&self) -> bool {
        true
    }

    async fn fallback(&self, ctx: &RecoveryContext) -> Result<bool, RawFailure> {
        self.modes.degrade_to_mode(
            self.fallback_mode,
            &format!("{} during {}", ctx.error.code, ctx.operation),
        );
        Ok(true)
    }
}

/// Renew the player's session; if that fails keep playing locally and ask them to sign in
pub struct RefreshSession {
    probe: Arc<dyn ConnectivityProbe>,
    modes: Arc<ServiceModeController>,
    events: EventBus,
}

impl RefreshSession {
    pub fn new(
        probe: Arc<dyn ConnectivityProbe>,
        modes: Arc<ServiceModeController>,
        events: EventBus,
    ) -> Self {
        Self {
            probe,
            modes,
            events,
        }
    }
}

#[async_trait]
impl RecoveryStrategy for RefreshSession {
    fn name(&self) -> &str {
        "refresh-session"
    }

    fn description(&self) -> &str {
        "Renew the sign-in session"
    }

    async fn execute(&self, _ctx: &RecoveryContext) -> Result<bool, RawFailure> {
        self.probe.refresh_session().await
    }

    fn has_fallback(&self) -> bool {
        true
    }

    async fn fallback(&self, ctx: &RecoveryContext) -> Result<bool, RawFailure> {
        self.modes.degrade_to_mode(
            ServiceMode::LocalOnly,
            &format!("{} during {}", ctx.error.code, ctx.operation),
        );
        self.events.notify(
            "Sign in again to keep your adventure saved in the cloud.",
            Severity::High,
        );
        Ok(true)
    }
}

/// Give up on the cloud for now and keep saving locally
pub struct DegradeToLocal {
    modes: Arc<ServiceModeController>,
    events: EventBus,
    reason: &'static str,
    message: &'static str,
}

impl DegradeToLocal {
    pub fn new(
        modes: Arc<ServiceModeController>,
        events: EventBus,
        reason: &'static str,
        message: &'static str,
    ) -> Self {
        Self {
            modes,
            events,
            reason,
            message,
        }
    }
}

#[async_trait]
impl RecoveryStrategy for DegradeToLocal {
    fn name(&self) -> &str {
        "degrade-to-local"
    }

    fn description(&self) -> &str {
        "Switch to local-only saves"
    }

    async fn execute(&self, ctx: &RecoveryContext) -> Result<bool, RawFailure> {
        self.modes.degrade_to_mode(
            ServiceMode::LocalOnly,
            &format!("{} ({})", self.reason, ctx.operation),
        );
        self.events.notify(self.message, ctx.error.severity);
        Ok(true)
    }
}
