use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CanonicalError, RawFailure};

/// Custom retry verdict: receives the failure and the attempt that produced it
pub type RetryPredicate = Arc<dyn Fn(&RawFailure, u32) -> bool + Send + Sync>;
/// Called before sleeping: (error, attempt that failed, delay before the next one)
pub type AttemptCallback = Arc<dyn Fn(&CanonicalError, u32, Duration) + Send + Sync>;
/// Called once when the executor gives up: (final error, attempts made)
pub type ExhaustedCallback = Arc<dyn Fn(&CanonicalError, u32) + Send + Sync>;

/// Backoff configuration for one category of operation.
///
/// Build it once and share it; the executor only ever reads it.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub jitter_factor: f64,
    should_retry: Option<RetryPredicate>,
    on_attempt: Option<AttemptCallback>,
    on_exhausted: Option<ExhaustedCallback>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("jitter_factor", &self.jitter_factor)
            .field("custom_predicate", &self.should_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter: false,
            jitter_factor: 0.0,
            should_retry: None,
            on_attempt: None,
            on_exhausted: None,
        }
    }

    /// Cloud reads and writes
    pub fn network() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(30), 2.0).with_jitter(0.1)
    }

    /// Saves the player must not lose
    pub fn critical() -> Self {
        Self::new(10, Duration::from_millis(500), Duration::from_secs(60), 1.5).with_jitter(0.2)
    }

    /// Quota checks and other housekeeping
    pub fn background() -> Self {
        Self::new(3, Duration::from_secs(5), Duration::from_secs(300), 3.0).with_jitter(0.3)
    }

    /// Interactive lookups where the player is waiting
    pub fn quick() -> Self {
        Self::new(2, Duration::from_millis(100), Duration::from_secs(1), 2.0)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = true;
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&RawFailure, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn on_attempt(
        mut self,
        callback: impl Fn(&CanonicalError, u32, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_attempt = Some(Arc::new(callback));
        self
    }

    pub fn on_exhausted(
        mut self,
        callback: impl Fn(&CanonicalError, u32) + Send + Sync + 'static,
    ) -> Self {
        self.on_exhausted = Some(Arc::new(callback));
        self
    }

    pub fn predicate(&self) -> Option<&RetryPredicate> {
        self.should_retry.as_ref()
    }

    pub(crate) fn attempt_callback(&self) -> Option<&AttemptCallback> {
        self.on_attempt.as_ref()
    }

    pub(crate) fn exhausted_callback(&self) -> Option<&ExhaustedCallback> {
        self.on_exhausted.as_ref()
    }

    /// Total tries allowed. Zero still means one try.
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the given failed attempt (1-based), without jitter:
    /// `min(max_delay, initial_delay * multiplier^(attempt - 1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(1024) as i32;
        let max_nanos = self.max_delay.as_nanos() as f64;
        let nanos = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= max_nanos {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Backoff delay perturbed uniformly by up to `±jitter_factor * delay`, never negative
    pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let spread = base.as_nanos() as f64 * self.jitter_factor;
        if !self.jitter || spread <= 0.0 {
            return base;
        }
        let offset = rng.gen_range(-spread..=spread);
        let nanos = (base.as_nanos() as f64 + offset).max(0.0);
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// The policy for each category of operation
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    pub network: RetryPolicy,
    pub critical: RetryPolicy,
    pub background: RetryPolicy,
    pub quick: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            network: RetryPolicy::network(),
            critical: RetryPolicy::critical(),
            background: RetryPolicy::background(),
            quick: RetryPolicy::quick(),
        }
    }
}

/// Serializable numeric part of a [`RetryPolicy`], as stored in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub jitter_factor: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self::from(&RetryPolicy::network())
    }
}

impl From<&RetryPolicy> for RetryPolicyConfig {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            jitter: policy.jitter,
            jitter_factor: policy.jitter_factor,
        }
    }
}

impl RetryPolicyConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_multiplier,
        );
        if self.jitter {
            policy.with_jitter(self.jitter_factor)
        } else {
            policy
        }
    }

    pub fn validate(&self, name: &str) -> anyhow::Result<()> {
        if self.backoff_multiplier < 1.0 {
            anyhow::bail!("retry.{name}: backoff_multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            anyhow::bail!("retry.{name}: jitter_factor must be between 0.0 and 1.0");
        }
        if self.initial_delay_ms > self.max_delay_ms {
            anyhow::bail!("retry.{name}: initial_delay_ms exceeds max_delay_ms");
        }
        Ok(())
    }
}
