use thiserror::Error;

use crate::error::RawFailure;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Storage quota exceeded: {used} of {limit} bytes")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("Record is malformed: {0}")]
    Corrupted(String),

    #[error("Injected failure after {0} write(s)")]
    Injected(usize),
}

impl From<StoreError> for RawFailure {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::Sqlite(e) => {
                use rusqlite::ErrorCode as Sql;
                let code = match e.sqlite_error_code() {
                    Some(Sql::DatabaseBusy | Sql::DatabaseLocked | Sql::CannotOpen) => {
                        Some("unavailable")
                    }
                    Some(Sql::DiskFull) => Some("quota-exceeded"),
                    Some(Sql::PermissionDenied | Sql::ReadOnly) => Some("permission-denied"),
                    Some(Sql::DatabaseCorrupt | Sql::NotADatabase) => Some("data-corrupted"),
                    _ => None,
                };
                match code {
                    Some(code) => RawFailure::coded(code, message),
                    None => RawFailure::new(message).with_name("SqliteError"),
                }
            }
            StoreError::Corrupted(_) => RawFailure::coded("data-corrupted", message),
            StoreError::Io(e) => RawFailure::from(e),
            // Injected failures stand in for a connection dropped mid-commit
            StoreError::Unavailable(_) | StoreError::Injected(_) => {
                RawFailure::coded("unavailable", message)
            }
            StoreError::QuotaExceeded { .. } => RawFailure::coded("quota-exceeded", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::retry::ErrorClassifier;

    fn code_of(err: StoreError) -> ErrorCode {
        ErrorClassifier::default().classify(&err.into()).code
    }

    #[test]
    fn test_store_errors_classify() {
        assert_eq!(
            code_of(StoreError::Unavailable("down".into())),
            ErrorCode::NetworkUnavailable
        );
        assert_eq!(
            code_of(StoreError::QuotaExceeded { used: 11, limit: 10 }),
            ErrorCode::StorageQuotaExceeded
        );
        assert_eq!(
            code_of(StoreError::Corrupted("bad row".into())),
            ErrorCode::DataCorrupted
        );
    }

    #[test]
    fn test_injected_failure_is_retryable() {
        let raw: RawFailure = StoreError::Injected(1).into();
        assert!(ErrorClassifier::default().is_retryable(&raw));
    }
}
