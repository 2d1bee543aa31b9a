//! One channel shared by independent callers.
//!
//! [`SharedSession`] builds its [`Session`] on first use and hands out
//! [`SessionLease`]s. When the last lease is dropped a grace timer starts;
//! the session is destroyed only if nobody re-acquires it before then.

use std::{
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tasklink_core::Connector;
use tokio::runtime::Handle;

use crate::{config::ChannelConfig, session::Session};

struct Slot {
    session: Option<Arc<Session>>,
    leases: usize,
    /// Bumped on every acquire and release; a grace timer only fires for
    /// the generation it was armed in.
    generation: u64,
}

struct Shared {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    slot: Mutex<Slot>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn expire(&self, generation: u64) {
        let session = {
            let mut slot = self.slot();
            if slot.generation != generation || slot.leases > 0 {
                return;
            }
            slot.session.take()
        };
        if let Some(session) = session {
            tracing::debug!("Shared session released after grace period");
            session.destroy().await;
        }
    }
}

/// Reference-counted owner of a lazily built session.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Shared>,
}

impl SharedSession {
    #[must_use]
    pub fn new(config: ChannelConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                connector,
                slot: Mutex::new(Slot {
                    session: None,
                    leases: 0,
                    generation: 0,
                }),
            }),
        }
    }

    /// Take a lease, building the session if none is live.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn acquire(&self) -> SessionLease {
        let mut slot = self.inner.slot();
        slot.leases += 1;
        slot.generation += 1;
        let session = match &slot.session {
            Some(session) => Arc::clone(session),
            None => {
                tracing::debug!("Building shared session");
                let session = Arc::new(Session::new(
                    self.inner.config.clone(),
                    Arc::clone(&self.inner.connector),
                ));
                slot.session = Some(Arc::clone(&session));
                session
            }
        };
        drop(slot);
        SessionLease {
            session,
            owner: Arc::clone(&self.inner),
        }
    }

    /// Outstanding leases.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.inner.slot().leases
    }

    /// Whether a session is currently built.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.slot().session.is_some()
    }
}

/// A claim on the shared session. Derefs to [`Session`].
pub struct SessionLease {
    session: Arc<Session>,
    owner: Arc<Shared>,
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut slot = self.owner.slot();
        slot.leases = slot.leases.saturating_sub(1);
        slot.generation += 1;
        if slot.leases > 0 {
            return;
        }

        let generation = slot.generation;
        drop(slot);
        let grace = self.owner.config.shared_grace();
        let owner = Arc::clone(&self.owner);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    owner.expire(generation).await;
                });
            }
            Err(_) => {
                // No runtime to run the grace timer on; drop the session now.
                owner.slot().session = None;
            }
        }
    }
}
