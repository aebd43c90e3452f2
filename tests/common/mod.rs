#![allow(dead_code)]

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

use savesync::config::SyncConfig;
use savesync::recovery::ManualProbe;
use savesync::retry::RetryPolicyConfig;
use savesync::store::MemoryStore;
use savesync::SaveSync;

/// Scratch data and config directories for one test
pub struct TestEnvironment {
    temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.path().join("data")
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("savesync.toml")
    }

    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.path().join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run the savesync binary against the environment's config and data dir
pub fn run_savesync(env: &TestEnvironment, args: &[&str]) -> Result<CommandOutput> {
    let output = Command::new(env!("CARGO_BIN_EXE_savesync"))
        .arg("--config")
        .arg(env.config_path())
        .arg("--data-dir")
        .arg(env.data_dir())
        .args(args)
        .output()?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Config with millisecond backoff so failure paths finish quickly
pub fn fast_config() -> SyncConfig {
    let fast = RetryPolicyConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 4,
        backoff_multiplier: 2.0,
        jitter: false,
        jitter_factor: 0.0,
    };
    let mut config = SyncConfig::default();
    config.retry.network = fast.clone();
    config.retry.critical = fast.clone();
    config.retry.background = fast.clone();
    config.retry.quick = fast;
    config.recovery.connectivity_poll_ms = 1;
    config.recovery.connectivity_polls = 2;
    config
}

pub struct MemoryStack {
    pub sync: SaveSync,
    pub remote: Arc<MemoryStore>,
    pub local: Arc<MemoryStore>,
    pub probe: Arc<ManualProbe>,
}

pub fn memory_stack(config: SyncConfig) -> MemoryStack {
    let remote = Arc::new(MemoryStore::new("remote"));
    let local = Arc::new(MemoryStore::new("local"));
    let probe = Arc::new(ManualProbe::default());
    let sync = SaveSync::builder(remote.clone(), local.clone(), probe.clone())
        .config(config)
        .build();
    MemoryStack {
        sync,
        remote,
        local,
        probe,
    }
}
