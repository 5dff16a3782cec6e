//! The current session and the connect gate.
//!
//! Exactly one session is current at a time. It lives in [`SharedSession`],
//! which is replaced by a single atomic publish; components read it on every
//! call and never keep a handle across a recovery.

use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    metrics,
    store::{Session, SessionId},
};

/// A published session together with its publish generation.
#[derive(Debug)]
pub struct SessionHandle {
    generation: u64,
    session: Arc<dyn Session>,
}

impl SessionHandle {
    /// publish generation, starting at 1 for the first session
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// store-assigned session id
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// the underlying session
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

impl Deref for SessionHandle {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

/// Error returned by [`SharedSession::current`] before the first publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotConnected;

/// The single shared "current session" reference.
#[derive(Debug, Clone, Default)]
pub struct SharedSession {
    slot: Arc<ArcSwapOption<SessionHandle>>,
    generation: Arc<AtomicU64>,
}

impl SharedSession {
    /// Empty, nothing published yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current session.
    pub fn current(&self) -> Result<Arc<SessionHandle>, NotConnected> {
        self.slot.load_full().ok_or(NotConnected)
    }

    /// Generation of the current session, 0 if none.
    pub fn generation(&self) -> u64 {
        self.slot
            .load()
            .as_ref()
            .map(|handle| handle.generation)
            .unwrap_or(0)
    }

    /// Atomically replace the current session, returning the new handle.
    /// Readers see either the previous handle or this one, never a mix.
    pub(crate) fn publish(&self, session: Arc<dyn Session>) -> Arc<SessionHandle> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = Arc::new(SessionHandle {
            generation,
            session,
        });
        self.slot.store(Some(Arc::clone(&handle)));
        metrics::SESSION_GENERATION.set(generation as i64);
        debug!(
            generation,
            session_id = handle.session_id(),
            "published current session"
        );
        handle
    }

    /// Remove the current session, returning it.
    pub(crate) fn take(&self) -> Option<Arc<SessionHandle>> {
        self.slot.swap(None)
    }
}

/// Waiting half of an armed gate.
#[derive(Debug)]
pub struct GateWaiter {
    rx: oneshot::Receiver<()>,
}

impl GateWaiter {
    /// Resolves when the gate fires. Errors if the gate was re-armed or
    /// dropped without firing.
    pub async fn wait(self) -> Result<(), oneshot::error::RecvError> {
        self.rx.await
    }
}

/// Holds at most one armed single-use gate.
///
/// Every open/recover cycle arms a fresh gate; the router releases it when the
/// session reports `connected`. A fired gate is never reused.
#[derive(Debug, Clone, Default)]
pub struct ConnectGate {
    armed: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ConnectGate {
    /// New, un-armed slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a fresh gate, abandoning any previously armed one.
    pub fn arm(&self) -> GateWaiter {
        let (tx, rx) = oneshot::channel();
        if self.armed.lock().replace(tx).is_some() {
            debug!("replaced an armed connect gate that never fired");
        }
        GateWaiter { rx }
    }

    /// Fire the armed gate. Returns true if a waiter was released; false if
    /// nothing was armed (already fired, or never armed).
    pub fn release(&self) -> bool {
        match self.armed.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => {
                trace!("connect gate release with nothing armed");
                false
            }
        }
    }

    /// Drop the armed gate without firing it; its waiter wakes with an error.
    pub fn abandon(&self) -> bool {
        self.armed.lock().take().is_some()
    }
}
