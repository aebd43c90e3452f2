use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed taxonomy of failure codes understood by the sync layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    NetworkUnavailable,
    NetworkError,
    AuthRequired,
    AuthExpired,
    AuthInvalid,
    StorageQuotaExceeded,
    DataCorrupted,
    DataChecksumMismatch,
    SyncConflict,
    OperationTimeout,
    Unknown,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 11] = [
        ErrorCode::NetworkUnavailable,
        ErrorCode::NetworkError,
        ErrorCode::AuthRequired,
        ErrorCode::AuthExpired,
        ErrorCode::AuthInvalid,
        ErrorCode::StorageQuotaExceeded,
        ErrorCode::DataCorrupted,
        ErrorCode::DataChecksumMismatch,
        ErrorCode::SyncConflict,
        ErrorCode::OperationTimeout,
        ErrorCode::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NetworkUnavailable => "network-unavailable",
            ErrorCode::NetworkError => "network-error",
            ErrorCode::AuthRequired => "auth-required",
            ErrorCode::AuthExpired => "auth-expired",
            ErrorCode::AuthInvalid => "auth-invalid",
            ErrorCode::StorageQuotaExceeded => "storage-quota-exceeded",
            ErrorCode::DataCorrupted => "data-corrupted",
            ErrorCode::DataChecksumMismatch => "data-checksum-mismatch",
            ErrorCode::SyncConflict => "sync-conflict",
            ErrorCode::OperationTimeout => "operation-timeout",
            ErrorCode::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == value)
    }

    /// Severity is fixed per code family
    pub fn severity(self) -> Severity {
        match self {
            ErrorCode::DataCorrupted | ErrorCode::DataChecksumMismatch => Severity::Critical,
            ErrorCode::AuthRequired
            | ErrorCode::AuthExpired
            | ErrorCode::AuthInvalid
            | ErrorCode::StorageQuotaExceeded => Severity::High,
            ErrorCode::NetworkUnavailable
            | ErrorCode::NetworkError
            | ErrorCode::OperationTimeout
            | ErrorCode::SyncConflict => Severity::Medium,
            ErrorCode::Unknown => Severity::Low,
        }
    }

    /// Message that is safe to show to a player
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorCode::NetworkUnavailable => {
                "You appear to be offline. Your progress is kept on this device."
            }
            ErrorCode::NetworkError => "We could not reach the save server. Please try again.",
            ErrorCode::AuthRequired => "Please sign in to save your game to the cloud.",
            ErrorCode::AuthExpired => "Your session has expired. Please sign in again.",
            ErrorCode::AuthInvalid => "Your account is not allowed to access these saves.",
            ErrorCode::StorageQuotaExceeded => {
                "Your cloud storage is full. Delete an old save to make room."
            }
            ErrorCode::DataCorrupted => "This save file is damaged and cannot be loaded.",
            ErrorCode::DataChecksumMismatch => {
                "This save file failed its integrity check and was not loaded."
            }
            ErrorCode::SyncConflict => {
                "This save was changed on another device. Choose which copy to keep."
            }
            ErrorCode::OperationTimeout => "The save server took too long to answer.",
            ErrorCode::Unknown => "Something went wrong while handling your save.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized failure. Every error leaving this crate's components has this shape.
///
/// Built by [`crate::retry::ErrorClassifier`]; other code describes failures
/// with [`RawFailure`] and lets the classifier decide the code.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct CanonicalError {
    pub code: ErrorCode,
    pub severity: Severity,
    pub retryable: bool,
    pub message: String,
    /// Stringified original failure, for logs only
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalError {
    pub(crate) fn from_classification(code: ErrorCode, retryable: bool, detail: String) -> Self {
        Self {
            code,
            severity: code.severity(),
            retryable,
            message: code.user_message().to_string(),
            detail,
            timestamp: Utc::now(),
        }
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

/// A failure as reported by a collaborator, before classification.
///
/// The identifier fields are consulted by the classifier in a fixed order:
/// `code`, then `status`, then `name`, then `kind`, then the message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFailure {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub message: String,
    pub(crate) canonical: Option<Box<CanonicalError>>,
}

impl RawFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(message).with_code(code)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// The already-normalized error this failure wraps, if any
    pub fn canonical(&self) -> Option<&CanonicalError> {
        self.canonical.as_deref()
    }
}

impl fmt::Display for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, self.message.is_empty()) {
            (Some(code), false) => write!(f, "{code}: {}", self.message),
            (Some(code), true) => f.write_str(code),
            (None, _) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RawFailure {}

impl From<CanonicalError> for RawFailure {
    fn from(err: CanonicalError) -> Self {
        Self {
            code: Some(err.code.as_str().to_string()),
            message: err.detail.clone(),
            canonical: Some(Box::new(err)),
            ..Self::default()
        }
    }
}

impl From<std::io::Error> for RawFailure {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string()).with_name(format!("{:?}", err.kind()))
    }
}

impl From<String> for RawFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for RawFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_parse_roundtrip() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("not-a-code"), None);
    }

    #[test]
    fn test_severity_by_family() {
        assert_eq!(ErrorCode::DataChecksumMismatch.severity(), Severity::Critical);
        assert_eq!(ErrorCode::AuthExpired.severity(), Severity::High);
        assert_eq!(ErrorCode::StorageQuotaExceeded.severity(), Severity::High);
        assert_eq!(ErrorCode::OperationTimeout.severity(), Severity::Medium);
        assert_eq!(ErrorCode::Unknown.severity(), Severity::Low);
        assert!(Severity::Critical > Severity::High);
    }

    #[test]
    fn test_raw_failure_display() {
        let coded = RawFailure::coded("unavailable", "backend down");
        assert_eq!(coded.to_string(), "unavailable: backend down");
        assert_eq!(RawFailure::new("boom").to_string(), "boom");
    }

    #[test]
    fn test_io_error_carries_kind_name() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let raw = RawFailure::from(io);
        assert_eq!(raw.name.as_deref(), Some("TimedOut"));
        assert!(raw.code.is_none());
    }

    #[test]
    fn test_canonical_error_serializes_kebab_code() {
        let err = CanonicalError::from_classification(
            ErrorCode::SyncConflict,
            false,
            "slot 1".to_string(),
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "sync-conflict");
        assert_eq!(json["severity"], "medium");
        assert_eq!(err.to_string(), ErrorCode::SyncConflict.user_message());
    }
}
