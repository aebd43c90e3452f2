//! Assembly of the full sync stack from a config and a pair of stores

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::events::EventBus;
use crate::quota::QuotaMonitor;
use crate::recovery::{
    ConnectivityProbe, RecoveryCoordinator, ServiceModeController, SystemStatus,
};
use crate::retry::ErrorClassifier;
use crate::save::{GzipCodec, OperationJournal, SaveCodec, SaveSyncCoordinator};
use crate::store::SaveStore;

/// Every long-lived component of the sync layer, wired to one event bus
pub struct SaveSync {
    pub events: EventBus,
    pub modes: Arc<ServiceModeController>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub coordinator: Arc<SaveSyncCoordinator>,
    pub quota: Arc<QuotaMonitor>,
}

impl SaveSync {
    pub fn builder(
        remote: Arc<dyn SaveStore>,
        local: Arc<dyn SaveStore>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> SaveSyncBuilder {
        SaveSyncBuilder {
            remote,
            local,
            probe,
            config: SyncConfig::default(),
            codec: None,
            journal: None,
            events: None,
        }
    }

    pub fn system_status(&self) -> SystemStatus {
        self.recovery.get_system_status()
    }

    pub fn shutdown(&self) {
        self.quota.stop_monitoring();
    }
}

pub struct SaveSyncBuilder {
    remote: Arc<dyn SaveStore>,
    local: Arc<dyn SaveStore>,
    probe: Arc<dyn ConnectivityProbe>,
    config: SyncConfig,
    codec: Option<Arc<dyn SaveCodec>>,
    journal: Option<Arc<OperationJournal>>,
    events: Option<EventBus>,
}

impl SaveSyncBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn SaveCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn journal(mut self, journal: Arc<OperationJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> SaveSync {
        let config = self.config;
        let events = self.events.unwrap_or_default();
        let classifier = ErrorClassifier::new(config.classifier.unknown_policy);

        let modes = Arc::new(ServiceModeController::new(
            Arc::clone(&self.probe),
            events.clone(),
        ));
        let recovery = Arc::new(RecoveryCoordinator::with_default_strategies(
            classifier,
            Arc::clone(&modes),
            self.probe,
            events.clone(),
            &config.recovery,
        ));

        let codec: Arc<dyn SaveCodec> = match self.codec {
            Some(codec) => codec,
            None => Arc::new(GzipCodec::default()),
        };
        let mut coordinator = SaveSyncCoordinator::new(
            self.remote,
            self.local,
            codec,
            Arc::clone(&recovery),
            events.clone(),
        )
        .with_policies(config.policies())
        .with_limits(config.limits.clone())
        .with_recovery_attempts(config.recovery.max_attempts);
        if let Some(journal) = self.journal {
            coordinator = coordinator.with_journal(journal);
        }
        let coordinator = Arc::new(coordinator);

        let quota = Arc::new(QuotaMonitor::new(
            Arc::clone(&coordinator) as _,
            config.quota.clone(),
            events.clone(),
        ));

        SaveSync {
            events,
            modes,
            recovery,
            coordinator,
            quota,
        }
    }
}
