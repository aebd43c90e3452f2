use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::common::paths;
use crate::quota::QuotaSettings;
use crate::recovery::RecoverySettings;
use crate::retry::{RetryPolicies, RetryPolicy, RetryPolicyConfig, UnknownErrorPolicy};
use crate::save::SaveLimits;

/// Per-category retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub network: RetryPolicyConfig,
    pub critical: RetryPolicyConfig,
    pub background: RetryPolicyConfig,
    pub quick: RetryPolicyConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            network: RetryPolicyConfig::from(&RetryPolicy::network()),
            critical: RetryPolicyConfig::from(&RetryPolicy::critical()),
            background: RetryPolicyConfig::from(&RetryPolicy::background()),
            quick: RetryPolicyConfig::from(&RetryPolicy::quick()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub unknown_policy: UnknownErrorPolicy,
}

/// Contents of `savesync.toml`. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetryConfig,
    pub classifier: ClassifierConfig,
    pub quota: QuotaSettings,
    pub limits: SaveLimits,
    pub recovery: RecoverySettings,
}

impl SyncConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(paths::config_file_path()?)
    }

    /// Read the config at `path`, writing the defaults there first if it does not exist
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            config.save_to_path(path)?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("reading savesync config {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing savesync config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("serializing savesync config")?;
        fs::write(path, content).context("writing savesync config")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.network.validate("network")?;
        self.retry.critical.validate("critical")?;
        self.retry.background.validate("background")?;
        self.retry.quick.validate("quick")?;
        self.quota.validate()?;
        self.limits.validate()?;
        if self.recovery.connectivity_poll_ms == 0 {
            anyhow::bail!("recovery: connectivity_poll_ms must be positive");
        }
        Ok(())
    }

    pub fn policies(&self) -> RetryPolicies {
        RetryPolicies {
            network: self.retry.network.to_policy(),
            critical: self.retry.critical.to_policy(),
            background: self.retry.background.to_policy(),
            quick: self.retry.quick.to_policy(),
        }
    }
}
