use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Centralized path management for savesync.
/// Every directory is created on first request.

/// Get the savesync config directory
pub fn savesync_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Unable to determine user config directory")?
        .join("savesync");

    ensure_dir(&config_dir, "config")?;
    Ok(config_dir)
}

/// Default location of `savesync.toml`
pub fn config_file_path() -> Result<PathBuf> {
    Ok(savesync_config_dir()?.join("savesync.toml"))
}

/// Get the default savesync data directory
pub fn savesync_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
            home.join(".local/share")
        })
        .join("savesync");

    ensure_dir(&data_dir, "data")?;
    Ok(data_dir)
}

/// Directory holding the local and remote databases under `data_dir`
pub fn stores_dir(data_dir: &Path) -> Result<PathBuf> {
    let stores = data_dir.join("stores");
    ensure_dir(&stores, "stores")?;
    Ok(stores)
}

/// Directory for the operation journal under `data_dir`
pub fn logs_dir(data_dir: &Path) -> Result<PathBuf> {
    let logs = data_dir.join("logs");
    ensure_dir(&logs, "logs")?;
    Ok(logs)
}

fn ensure_dir(dir: &Path, what: &str) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating {what} directory at {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_data_subdirectories_are_created() {
        let dir = TempDir::new().unwrap();
        let stores = stores_dir(dir.path()).unwrap();
        let logs = logs_dir(dir.path()).unwrap();
        assert!(stores.is_dir());
        assert!(logs.is_dir());
        assert_eq!(logs, dir.path().join("logs"));
    }
}
