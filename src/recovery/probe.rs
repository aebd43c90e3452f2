use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::RawFailure;
use crate::store::SaveStore;
use crate::ui::prelude::*;

/// Connectivity and session checks used by restoration and recovery strategies
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;

    async fn is_authenticated(&self) -> bool {
        true
    }

    /// Try to renew the player's session. Returns whether a valid session exists afterwards.
    async fn refresh_session(&self) -> Result<bool, RawFailure> {
        Ok(self.is_authenticated().await)
    }
}

/// Probe with switchable answers, for embedding hosts that track connectivity themselves
#[derive(Debug)]
pub struct ManualProbe {
    online: AtomicBool,
    authenticated: AtomicBool,
}

impl Default for ManualProbe {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl ManualProbe {
    pub fn new(online: bool, authenticated: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            authenticated: AtomicBool::new(authenticated),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

/// Treats the remote store's health check as the connectivity signal
pub struct StoreProbe {
    store: Arc<dyn SaveStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn SaveStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConnectivityProbe for StoreProbe {
    async fn is_online(&self) -> bool {
        match self.store.health_check().await {
            Ok(()) => true,
            Err(err) => {
                emit(
                    Level::Debug,
                    "probe.unreachable",
                    &format!("The {} store is unreachable: {err}", self.store.name()),
                    None,
                );
                false
            }
        }
    }
}
