//! Coordination Session Lifecycle
//!
//! Holds the current session handle behind its own lock. On expiry the
//! handle is discarded and rebuilt wholesale through the session factory,
//! never patched in place.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{watch, RwLock};

use super::CoordinationStore;
use crate::error::Result;

/// Produces a fresh coordination session
pub type SessionFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn CoordinationStore>>> + Send + Sync>;

/// The replica's one live coordination session
pub struct Session {
    current: RwLock<Arc<dyn CoordinationStore>>,
    factory: SessionFactory,
}

impl Session {
    /// Open the initial session through the factory
    pub async fn connect(factory: SessionFactory) -> Result<Self> {
        let initial = (factory)().await?;
        Ok(Self {
            current: RwLock::new(initial),
            factory,
        })
    }

    /// The current session handle. Callers take a fresh handle per
    /// operation batch; a handle outliving its session fails every call
    /// with `SessionExpired`.
    pub async fn store(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&*self.current.read().await)
    }

    /// Expiry signal of the current session
    pub async fn expired_watch(&self) -> watch::Receiver<bool> {
        self.current.read().await.expired()
    }

    /// Discard the current session and build a new one from scratch
    pub async fn renew(&self) -> Result<Arc<dyn CoordinationStore>> {
        let fresh = (self.factory)().await?;
        let mut current = self.current.write().await;
        *current = Arc::clone(&fresh);
        tracing::info!(session = fresh.session_id(), "coordination session rebuilt");
        Ok(fresh)
    }
}
