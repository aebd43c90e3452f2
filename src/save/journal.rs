use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use super::types::OpResult;
use crate::identity::UserId;
use crate::recovery::ServiceMode;

const LOG_FILE: &str = "operations.jsonl";

/// One line of the operation journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLog {
    pub timestamp: DateTime<Utc>,
    pub operation_id: String,
    pub operation: String,
    pub user: UserId,
    pub slot: Option<u32>,
    pub success: bool,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub elapsed_ms: u64,
    pub mode: ServiceMode,
}

impl OperationLog {
    pub fn from_result<T>(
        result: &OpResult<T>,
        user: &UserId,
        slot: Option<u32>,
        mode: ServiceMode,
    ) -> Self {
        Self {
            timestamp: result.timestamp,
            operation_id: result.operation_id.clone(),
            operation: result.operation.clone(),
            user: user.clone(),
            slot,
            success: result.success,
            error_code: result.error.as_ref().map(|e| e.code.as_str().to_string()),
            error_detail: result.error.as_ref().map(|e| e.detail.clone()),
            elapsed_ms: result.elapsed.as_millis() as u64,
            mode,
        }
    }
}

/// Append-only JSONL journal of coordinator operations.
///
/// Only writes while debug mode is on unless built with [`OperationJournal::always`].
#[derive(Debug)]
pub struct OperationJournal {
    log_dir: PathBuf,
    debug_only: bool,
    write_lock: Mutex<()>,
}

impl OperationJournal {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            debug_only: true,
            write_lock: Mutex::new(()),
        }
    }

    pub fn always(log_dir: PathBuf) -> Self {
        Self {
            debug_only: false,
            ..Self::new(log_dir)
        }
    }

    fn enabled(&self) -> bool {
        !self.debug_only || crate::ui::is_debug_enabled()
    }

    fn log_file_path(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE)
    }

    pub fn record(&self, entry: &OperationLog) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        create_dir_all(&self.log_dir).context("Failed to create operation log directory")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file_path())
            .context("Failed to open operation log file")?;

        let json_line =
            serde_json::to_string(entry).context("Failed to serialize operation log entry")?;
        writeln!(file, "{json_line}").context("Failed to write to operation log file")?;
        Ok(())
    }

    /// Entries newest first
    pub fn get_logs(&self) -> Result<Vec<OperationLog>> {
        let log_file = self.log_file_path();
        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content =
            std::fs::read_to_string(&log_file).context("Failed to read operation log file")?;

        let mut logs = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let log: OperationLog =
                serde_json::from_str(line).context("Failed to parse operation log entry")?;
            logs.push(log);
        }

        logs.reverse();
        Ok(logs)
    }

    pub fn clear_logs(&self) -> Result<()> {
        let log_file = self.log_file_path();
        if log_file.exists() {
            std::fs::remove_file(&log_file).context("Failed to remove operation log file")?;
        }
        Ok(())
    }

    pub fn print_recent_logs(&self, limit: usize) -> Result<()> {
        use crate::ui::prelude::*;

        let logs = self.get_logs()?;
        if logs.is_empty() {
            emit(Level::Info, "log.empty", "No operations recorded yet.", None);
            return Ok(());
        }

        emit(Level::Info, "log.list.start", "Recent operations:", None);
        separator();
        for log in logs.iter().take(limit) {
            let time_str = log.timestamp.format("%Y-%m-%d %H:%M:%S UTC");
            let slot = log.slot.map(|s| format!(" slot {s}")).unwrap_or_default();
            let outcome = match &log.error_code {
                None => "ok".to_string(),
                Some(code) => code.clone(),
            };
            let text = format!(
                "{time_str}  {:<8} {}{slot}  {outcome}  {}ms  [{}]",
                log.operation, log.user, log.elapsed_ms, log.mode
            );
            let level = if log.success { Level::Info } else { Level::Warn };
            emit(
                level,
                "log.entry",
                &text,
                Some(serde_json::to_value(log).unwrap_or_default()),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn result(operation: &str, success: bool) -> OpResult<()> {
        OpResult {
            success,
            data: success.then_some(()),
            error: None,
            operation: operation.to_string(),
            operation_id: format!("{operation}-1"),
            timestamp: Utc::now(),
            elapsed: Duration::from_millis(12),
        }
    }

    #[test]
    fn test_records_newest_first_and_clears() {
        let dir = TempDir::new().unwrap();
        let journal = OperationJournal::always(dir.path().join("logs"));
        let user = UserId::from("ada");

        for op in ["save", "load"] {
            let entry =
                OperationLog::from_result(&result(op, true), &user, Some(1), ServiceMode::CloudEnabled);
            journal.record(&entry).unwrap();
        }

        let logs = journal.get_logs().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].operation, "load");
        assert_eq!(logs[0].elapsed_ms, 12);

        journal.clear_logs().unwrap();
        assert!(journal.get_logs().unwrap().is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn test_debug_only_journal_is_silent_without_debug() {
        crate::ui::set_debug_mode(false);
        let dir = TempDir::new().unwrap();
        let journal = OperationJournal::new(dir.path().to_path_buf());
        let entry = OperationLog::from_result(
            &result("delete", true),
            &UserId::from("ada"),
            None,
            ServiceMode::Offline,
        );
        journal.record(&entry).unwrap();
        assert!(journal.get_logs().unwrap().is_empty());
    }
}
