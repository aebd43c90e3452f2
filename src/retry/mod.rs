//! Bounded exponential-backoff retries and failure classification

mod classify;
mod executor;
mod policy;

pub use classify::{ErrorClassifier, IdentifierSource, UnknownErrorPolicy, extract_identifier};
pub use executor::{OperationOutcome, RetryExecutor};
pub use policy::{
    AttemptCallback, ExhaustedCallback, RetryPolicies, RetryPolicy, RetryPolicyConfig,
    RetryPredicate,
};
