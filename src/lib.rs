//! Resilience and synchronization layer for cloud game saves.
//!
//! [`service::SaveSync`] assembles the pieces: retries with backoff
//! ([`retry`]), error classification, strategy-based recovery and service
//! modes ([`recovery`]), quota monitoring ([`quota`]) and the save/sync
//! coordinator ([`save`]) on top of two [`store::SaveStore`] backends.

pub mod common;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod quota;
pub mod recovery;
pub mod retry;
pub mod save;
pub mod service;
pub mod store;
pub mod ui;

pub use config::SyncConfig;
pub use error::{CanonicalError, ErrorCode, RawFailure, Severity};
pub use events::{EventBus, SyncEvent};
pub use identity::UserId;
pub use service::{SaveSync, SaveSyncBuilder};
