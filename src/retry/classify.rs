use serde::{Deserialize, Serialize};

use crate::error::{CanonicalError, ErrorCode, RawFailure};

/// What to do with a failure whose identifier matches neither membership list.
///
/// The default retries only when the failure carried no explicit code or status:
/// a failure we cannot identify at all is assumed transient, while an explicit
/// code we do not recognise is assumed to be a deliberate refusal. This can hide
/// a fatal error behind a few retries, which is why it is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownErrorPolicy {
    #[default]
    RetryWhenUncoded,
    NeverRetry,
    AlwaysRetry,
}

/// Where the classification identifier was found, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierSource {
    Code,
    Status,
    Name,
    Kind,
    Message,
}

impl IdentifierSource {
    pub fn is_explicit(self) -> bool {
        matches!(self, IdentifierSource::Code | IdentifierSource::Status)
    }
}

// Identifiers are compared lowercased with any `namespace/` prefix removed.
const RETRYABLE: &[&str] = &[
    "unavailable",
    "deadline-exceeded",
    "resource-exhausted",
    "aborted",
    "internal",
    "network-request-failed",
    "network-unavailable",
    "network-error",
    "operation-timeout",
    "timeout",
    "timeouterror",
    "networkerror",
    "etimedout",
    "econnreset",
    "econnrefused",
    "econnaborted",
    "enotfound",
    "eai_again",
    "enetunreach",
    "timedout",
    "connectionreset",
    "connectionrefused",
    "connectionaborted",
    "notconnected",
    "brokenpipe",
    "interrupted",
    "408",
    "429",
    "500",
    "502",
    "503",
    "504",
];

const NON_RETRYABLE: &[&str] = &[
    "permission-denied",
    "unauthenticated",
    "invalid-argument",
    "not-found",
    "already-exists",
    "failed-precondition",
    "out-of-range",
    "unimplemented",
    "auth-required",
    "auth-expired",
    "auth-invalid",
    "user-token-expired",
    "id-token-expired",
    "invalid-user-token",
    "user-disabled",
    "requires-recent-login",
    "storage-quota-exceeded",
    "quota-exceeded",
    "quotaexceedederror",
    "data-corrupted",
    "data-loss",
    "data-checksum-mismatch",
    "checksum-mismatch",
    "sync-conflict",
    "conflict",
    "permissiondenied",
    "notfound",
    "invalidinput",
    "invaliddata",
    "400",
    "401",
    "403",
    "404",
    "409",
    "413",
];

/// Pick the identifier used for classification.
///
/// Priority is part of the contract: explicit code, HTTP-style status, named
/// error type, generic type tag, and finally the stringified failure.
pub fn extract_identifier(raw: &RawFailure) -> (String, IdentifierSource) {
    let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();

    if let Some(code) = non_empty(&raw.code) {
        return (normalize(&code), IdentifierSource::Code);
    }
    if let Some(status) = raw.status {
        return (status.to_string(), IdentifierSource::Status);
    }
    if let Some(name) = non_empty(&raw.name) {
        return (normalize(&name), IdentifierSource::Name);
    }
    if let Some(kind) = non_empty(&raw.kind) {
        return (normalize(&kind), IdentifierSource::Kind);
    }
    (normalize(&raw.message), IdentifierSource::Message)
}

fn normalize(identifier: &str) -> String {
    let trimmed = identifier.trim();
    let bare = trimmed.rsplit_once('/').map_or(trimmed, |(_, rest)| rest);
    bare.to_ascii_lowercase()
}

fn code_for(identifier: &str) -> ErrorCode {
    match identifier {
        "network-unavailable" | "unavailable" | "enotfound" | "eai_again" | "enetunreach"
        | "notconnected" | "offline" | "503" => ErrorCode::NetworkUnavailable,
        "network-error" | "network-request-failed" | "networkerror" | "econnreset"
        | "econnrefused" | "econnaborted" | "connectionreset" | "connectionrefused"
        | "connectionaborted" | "brokenpipe" | "interrupted" | "internal" | "aborted" | "429"
        | "500" | "502" => ErrorCode::NetworkError,
        "operation-timeout" | "deadline-exceeded" | "timeout" | "timeouterror" | "etimedout"
        | "timedout" | "408" | "504" => ErrorCode::OperationTimeout,
        "auth-required" | "unauthenticated" | "401" => ErrorCode::AuthRequired,
        "auth-expired" | "user-token-expired" | "id-token-expired" | "requires-recent-login" => {
            ErrorCode::AuthExpired
        }
        "auth-invalid" | "permission-denied" | "permissiondenied" | "invalid-user-token"
        | "user-disabled" | "403" => ErrorCode::AuthInvalid,
        "storage-quota-exceeded" | "quota-exceeded" | "quotaexceedederror"
        | "resource-exhausted" | "413" | "507" => ErrorCode::StorageQuotaExceeded,
        "data-corrupted" | "data-loss" | "invaliddata" => ErrorCode::DataCorrupted,
        "data-checksum-mismatch" | "checksum-mismatch" => ErrorCode::DataChecksumMismatch,
        "sync-conflict" | "conflict" | "already-exists" | "409" => ErrorCode::SyncConflict,
        other => match other.parse::<u16>() {
            Ok(status) if (500..600).contains(&status) => ErrorCode::NetworkError,
            _ => ErrorCode::Unknown,
        },
    }
}

/// Maps raw failures onto the canonical taxonomy
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier {
    unknown_policy: UnknownErrorPolicy,
}

impl ErrorClassifier {
    pub fn new(unknown_policy: UnknownErrorPolicy) -> Self {
        Self { unknown_policy }
    }

    pub fn unknown_policy(&self) -> UnknownErrorPolicy {
        self.unknown_policy
    }

    /// Classify a raw failure. Already-canonical failures pass through unchanged.
    pub fn classify(&self, raw: &RawFailure) -> CanonicalError {
        if let Some(canonical) = raw.canonical() {
            return canonical.clone();
        }

        let (identifier, source) = extract_identifier(raw);
        let retryable = self.retryable_verdict(&identifier, source);
        CanonicalError::from_classification(code_for(&identifier), retryable, raw.to_string())
    }

    pub fn is_retryable(&self, raw: &RawFailure) -> bool {
        self.classify(raw).retryable
    }

    fn retryable_verdict(&self, identifier: &str, source: IdentifierSource) -> bool {
        if NON_RETRYABLE.contains(&identifier) {
            return false;
        }
        if RETRYABLE.contains(&identifier) {
            return true;
        }
        // HTTP-style families for statuses not listed explicitly
        if let Ok(status) = identifier.parse::<u16>() {
            if (500..600).contains(&status) {
                return true;
            }
            if (400..500).contains(&status) {
                return false;
            }
        }
        match self.unknown_policy {
            UnknownErrorPolicy::RetryWhenUncoded => !source.is_explicit(),
            UnknownErrorPolicy::NeverRetry => false,
            UnknownErrorPolicy::AlwaysRetry => true,
        }
    }
}
