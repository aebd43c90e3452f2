//! Strategy-based recovery on top of classified failures, and the service
//! mode state those strategies drive.

mod mode;
mod probe;
pub mod strategies;

pub use mode::{ModeTransition, ServiceMode, ServiceModeController};
pub use probe::{ConnectivityProbe, ManualProbe, StoreProbe};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{CanonicalError, ErrorCode, RawFailure, Severity};
use crate::events::EventBus;
use crate::retry::ErrorClassifier;
use crate::ui::prelude::*;

/// What a strategy gets to look at when it runs
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub error: CanonicalError,
    pub operation: String,
    pub attempt: u32,
}

/// A named remediation for one error code.
///
/// Contract: when `execute` (or `fallback`) reports success, the condition that
/// caused the failure must already be resolved or worked around. The coordinator
/// re-runs the failed operation immediately with no backoff, so a strategy that
/// returns `true` without waiting (for connectivity, a new session, ...) turns
/// into a retry storm.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, ctx: &RecoveryContext) -> Result<bool, RawFailure>;

    fn has_fallback(&self) -> bool {
        false
    }

    /// Runs when `execute` fails or reports `false`, if [`Self::has_fallback`]
    async fn fallback(&self, _ctx: &RecoveryContext) -> Result<bool, RawFailure> {
        Ok(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Attempts for `execute_with_recovery` as used by the save coordinator
    pub max_attempts: u32,
    pub connectivity_poll_ms: u64,
    pub connectivity_polls: u32,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            connectivity_poll_ms: 500,
            connectivity_polls: 10,
        }
    }
}

impl RecoverySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub mode: ServiceMode,
    pub fallback_mode: bool,
    pub last_transition: Option<ModeTransition>,
    pub registered_strategies: BTreeMap<String, usize>,
}

/// Looks up and runs recovery strategies for classified failures.
///
/// Strategies are registered while the coordinator is being built (`&mut self`);
/// once shared behind an `Arc` the registry is read-only.
pub struct RecoveryCoordinator {
    strategies: HashMap<ErrorCode, Vec<Arc<dyn RecoveryStrategy>>>,
    classifier: ErrorClassifier,
    modes: Arc<ServiceModeController>,
    fallback_mode: AtomicBool,
}

impl RecoveryCoordinator {
    pub fn new(classifier: ErrorClassifier, modes: Arc<ServiceModeController>) -> Self {
        Self {
            strategies: HashMap::new(),
            classifier,
            modes,
            fallback_mode: AtomicBool::new(false),
        }
    }

    /// Coordinator with the stock strategies for network, auth and quota failures
    pub fn with_default_strategies(
        classifier: ErrorClassifier,
        modes: Arc<ServiceModeController>,
        probe: Arc<dyn ConnectivityProbe>,
        events: EventBus,
        settings: &RecoverySettings,
    ) -> Self {
        let mut coordinator = Self::new(classifier, Arc::clone(&modes));
        strategies::register_defaults(&mut coordinator, modes, probe, events, settings);
        coordinator
    }

    pub fn register_strategy(&mut self, code: ErrorCode, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.entry(code).or_default().push(strategy);
    }

    pub fn strategies_for(&self, code: ErrorCode) -> &[Arc<dyn RecoveryStrategy>] {
        self.strategies.get(&code).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn modes(&self) -> &Arc<ServiceModeController> {
        &self.modes
    }

    pub fn is_recoverable(&self, error: &CanonicalError) -> bool {
        let has_strategy = !self.strategies_for(error.code).is_empty();
        if error.severity == Severity::Critical && !has_strategy {
            return false;
        }
        if !error.retryable && !has_strategy {
            return false;
        }
        true
    }

    /// Run the strategies registered for the error's code, in registration order.
    /// The first strategy that succeeds (directly or through its fallback) wins.
    ///
    /// Besides logging, the only state this touches is the advisory fallback
    /// flag: it is raised when a strategy's `fallback` is what succeeded, and
    /// cleared again by [`crate::save::SaveSyncCoordinator::restore_cloud`].
    pub async fn attempt_recovery(&self, ctx: &RecoveryContext) -> bool {
        for strategy in self.strategies_for(ctx.error.code) {
            match strategy.execute(ctx).await {
                Ok(true) => {
                    self.report_success(strategy.as_ref(), ctx, false);
                    return true;
                }
                Ok(false) => {}
                Err(err) => emit(
                    Level::Debug,
                    "recovery.strategy_failed",
                    &format!("Recovery strategy '{}' failed: {err}", strategy.name()),
                    Some(serde_json::json!({
                        "strategy": strategy.name(),
                        "operation": ctx.operation,
                    })),
                ),
            }

            if !strategy.has_fallback() {
                continue;
            }
            match strategy.fallback(ctx).await {
                Ok(true) => {
                    self.enable_fallback_mode();
                    self.report_success(strategy.as_ref(), ctx, true);
                    return true;
                }
                Ok(false) => {}
                Err(err) => emit(
                    Level::Debug,
                    "recovery.fallback_failed",
                    &format!("Fallback of '{}' failed: {err}", strategy.name()),
                    Some(serde_json::json!({
                        "strategy": strategy.name(),
                        "operation": ctx.operation,
                    })),
                ),
            }
        }

        emit(
            Level::Warn,
            "recovery.exhausted",
            &format!(
                "No recovery strategy could handle {} during {}",
                ctx.error.code, ctx.operation
            ),
            Some(serde_json::json!({
                "code": ctx.error.code.as_str(),
                "operation": ctx.operation,
                "strategies": self.strategies_for(ctx.error.code).len(),
            })),
        );
        false
    }

    /// Run `operation`, attempting qualitative recovery between failures.
    ///
    /// Unlike [`crate::retry::RetryExecutor`] there is no backoff here: the operation
    /// is re-run only after a recovery strategy reported success.
    pub async fn execute_with_recovery<T, E, F, Fut>(
        &self,
        mut operation: F,
        name: &str,
        max_attempts: u32,
    ) -> Result<T, CanonicalError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawFailure>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let failure: RawFailure = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err.into(),
            };
            let error = self.classifier.classify(&failure);

            let last_attempt = attempt >= max_attempts;
            if last_attempt || !self.is_recoverable(&error) {
                return Err(error);
            }

            let ctx = RecoveryContext {
                error,
                operation: name.to_string(),
                attempt,
            };
            if !self.attempt_recovery(&ctx).await {
                return Err(ctx.error);
            }
        }
    }

    pub fn enable_fallback_mode(&self) {
        self.fallback_mode.store(true, Ordering::SeqCst);
    }

    pub fn disable_fallback_mode(&self) {
        self.fallback_mode.store(false, Ordering::SeqCst);
    }

    pub fn is_fallback_mode(&self) -> bool {
        self.fallback_mode.load(Ordering::SeqCst)
    }

    pub fn get_system_status(&self) -> SystemStatus {
        SystemStatus {
            mode: self.modes.get_mode(),
            fallback_mode: self.is_fallback_mode(),
            last_transition: self.modes.last_transition(),
            registered_strategies: self
                .strategies
                .iter()
                .map(|(code, list)| (code.as_str().to_string(), list.len()))
                .collect(),
        }
    }

    fn report_success(&self, strategy: &dyn RecoveryStrategy, ctx: &RecoveryContext, fallback: bool) {
        let via = if fallback { " (fallback)" } else { "" };
        emit(
            Level::Info,
            "recovery.strategy_succeeded",
            &format!(
                "Recovered from {} during {} using '{}'{via}",
                ctx.error.code,
                ctx.operation,
                strategy.name()
            ),
            Some(serde_json::json!({
                "code": ctx.error.code.as_str(),
                "operation": ctx.operation,
                "strategy": strategy.name(),
                "fallback": fallback,
                "attempt": ctx.attempt,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    /// Records its invocations into a shared journal
    struct Scripted {
        name: &'static str,
        execute: Result<bool, &'static str>,
        fallback: Option<bool>,
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RecoveryStrategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "scripted strategy"
        }

        async fn execute(&self, _ctx: &RecoveryContext) -> Result<bool, RawFailure> {
            self.journal.lock().unwrap().push(format!("{}:execute", self.name));
            self.execute.map_err(RawFailure::new)
        }

        fn has_fallback(&self) -> bool {
            self.fallback.is_some()
        }

        async fn fallback(&self, _ctx: &RecoveryContext) -> Result<bool, RawFailure> {
            self.journal.lock().unwrap().push(format!("{}:fallback", self.name));
            Ok(self.fallback.unwrap_or(false))
        }
    }

    fn coordinator() -> RecoveryCoordinator {
        let modes = Arc::new(ServiceModeController::new(
            Arc::new(ManualProbe::default()),
            EventBus::default(),
        ));
        RecoveryCoordinator::new(ErrorClassifier::default(), modes)
    }

    fn classify(code: &str) -> CanonicalError {
        ErrorClassifier::default().classify(&RawFailure::coded(code, "test"))
    }

    fn ctx(code: &str) -> RecoveryContext {
        RecoveryContext {
            error: classify(code),
            operation: "save".to_string(),
            attempt: 1,
        }
    }

    fn scripted(
        name: &'static str,
        execute: Result<bool, &'static str>,
        fallback: Option<bool>,
        journal: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn RecoveryStrategy> {
        Arc::new(Scripted {
            name,
            execute,
            fallback,
            journal: Arc::clone(journal),
        })
    }

    #[test]
    fn test_unregistered_critical_or_fatal_is_not_recoverable() {
        let coordinator = coordinator();
        assert!(!coordinator.is_recoverable(&classify("data-corrupted")));
        assert!(!coordinator.is_recoverable(&classify("auth-required")));
        assert!(coordinator.is_recoverable(&classify("unavailable")));
    }

    #[test]
    fn test_registered_strategy_makes_fatal_recoverable() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = coordinator();
        coordinator.register_strategy(
            ErrorCode::AuthRequired,
            scripted("sign-in", Ok(true), None, &journal),
        );
        assert!(coordinator.is_recoverable(&classify("auth-required")));
    }

    #[tokio::test]
    async fn test_strategies_run_in_registration_order_until_success() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = coordinator();
        coordinator.register_strategy(
            ErrorCode::NetworkUnavailable,
            scripted("first", Ok(false), None, &journal),
        );
        coordinator.register_strategy(
            ErrorCode::NetworkUnavailable,
            scripted("second", Err("boom"), Some(true), &journal),
        );
        coordinator.register_strategy(
            ErrorCode::NetworkUnavailable,
            scripted("third", Ok(true), None, &journal),
        );

        assert!(coordinator.attempt_recovery(&ctx("unavailable")).await);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["first:execute", "second:execute", "second:fallback"]
        );
        assert!(coordinator.is_fallback_mode());
    }

    #[tokio::test]
    async fn test_recovery_fails_when_every_strategy_fails() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = coordinator();
        coordinator.register_strategy(
            ErrorCode::OperationTimeout,
            scripted("wait", Ok(false), Some(false), &journal),
        );
        assert!(!coordinator.attempt_recovery(&ctx("timeout")).await);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["wait:execute", "wait:fallback"]
        );
    }

    #[tokio::test]
    async fn test_execute_with_recovery_retries_after_recovery() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = coordinator();
        coordinator.register_strategy(
            ErrorCode::AuthExpired,
            scripted("refresh", Ok(true), None, &journal),
        );

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = coordinator
            .execute_with_recovery(
                move || {
                    let call = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call == 0 {
                            Err(RawFailure::coded("user-token-expired", "expired"))
                        } else {
                            Ok(42)
                        }
                    }
                },
                "load",
                3,
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_with_recovery_propagates_unrecoverable() {
        let coordinator = coordinator();
        let result: Result<(), _> = coordinator
            .execute_with_recovery(
                || async { Err(RawFailure::coded("checksum-mismatch", "bad bytes")) },
                "load",
                5,
            )
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::DataChecksumMismatch);
        assert_eq!(err.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_last_attempt_is_not_recovered() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = coordinator();
        coordinator.register_strategy(
            ErrorCode::NetworkUnavailable,
            scripted("wait", Ok(true), None, &journal),
        );

        let result: Result<(), _> = coordinator
            .execute_with_recovery(
                || async { Err(RawFailure::coded("unavailable", "down")) },
                "save",
                2,
            )
            .await;
        assert!(result.is_err());
        // Recovery ran between attempt 1 and 2 only
        assert_eq!(*journal.lock().unwrap(), vec!["wait:execute"]);
    }

    #[test]
    fn test_system_status_reports_registry_and_flag() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = coordinator();
        coordinator.register_strategy(
            ErrorCode::StorageQuotaExceeded,
            scripted("degrade", Ok(true), None, &journal),
        );
        coordinator.enable_fallback_mode();

        let status = coordinator.get_system_status();
        assert!(status.fallback_mode);
        assert_eq!(status.mode, ServiceMode::CloudEnabled);
        assert_eq!(status.registered_strategies.get("storage-quota-exceeded"), Some(&1));

        coordinator.disable_fallback_mode();
        assert!(!coordinator.get_system_status().fallback_mode);
    }
}
