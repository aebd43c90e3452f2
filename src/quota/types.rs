use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaLevel {
    Normal,
    Warning,
    Critical,
    Exceeded,
}

impl QuotaLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaLevel::Normal => "normal",
            QuotaLevel::Warning => "warning",
            QuotaLevel::Critical => "critical",
            QuotaLevel::Exceeded => "exceeded",
        }
    }
}

impl std::fmt::Display for QuotaLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotUsage {
    pub slot: u32,
    pub name: String,
    /// Stored (compressed) bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_played_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub usage_percentage: u32,
    pub available_bytes: u64,
    pub total_saves: usize,
    pub level: QuotaLevel,
    pub message: String,
    pub last_checked: DateTime<Utc>,
    pub slots: Vec<SlotUsage>,
}

impl QuotaStatus {
    /// Placeholder used when usage could not be read and nothing is known yet
    pub fn unknown(max_bytes: u64, reason: &str) -> Self {
        Self {
            used_bytes: 0,
            max_bytes,
            usage_percentage: 0,
            available_bytes: max_bytes,
            total_saves: 0,
            level: QuotaLevel::Normal,
            message: format!("Storage usage is unavailable right now ({reason})"),
            last_checked: Utc::now(),
            slots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Warning,
    Critical,
    Exceeded,
    Recovered,
    CleanupCompleted,
    CleanupFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub label: String,
    pub action: String,
}

impl NotificationAction {
    pub fn new(label: &str, action: &str) -> Self {
        Self {
            label: label.to_string(),
            action: action.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaNotification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub max_bytes: u64,
    /// Percent of `max_bytes`
    pub warning_threshold: u32,
    pub critical_threshold: u32,
    pub check_interval_secs: u64,
    /// Same-level usage moves smaller than this are not reported
    pub significant_change_points: u32,
    pub auto_cleanup: bool,
    pub max_saves_to_keep: usize,
    pub notification_history: usize,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            warning_threshold: 80,
            critical_threshold: 95,
            check_interval_secs: 300,
            significant_change_points: 5,
            auto_cleanup: false,
            max_saves_to_keep: 5,
            notification_history: 50,
        }
    }
}

impl QuotaSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_bytes == 0 {
            anyhow::bail!("quota: max_bytes must be positive");
        }
        if self.warning_threshold == 0
            || self.warning_threshold >= self.critical_threshold
            || self.critical_threshold > 100
        {
            anyhow::bail!(
                "quota: thresholds must satisfy 0 < warning ({}) < critical ({}) <= 100",
                self.warning_threshold,
                self.critical_threshold
            );
        }
        if self.check_interval_secs == 0 {
            anyhow::bail!("quota: check_interval_secs must be positive");
        }
        if self.notification_history == 0 {
            anyhow::bail!("quota: notification_history must be positive");
        }
        Ok(())
    }

    pub fn level_for(&self, usage_percentage: u32) -> QuotaLevel {
        if usage_percentage >= 100 {
            QuotaLevel::Exceeded
        } else if usage_percentage >= self.critical_threshold {
            QuotaLevel::Critical
        } else if usage_percentage >= self.warning_threshold {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Normal
        }
    }
}
