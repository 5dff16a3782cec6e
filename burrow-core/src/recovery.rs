//! Opening sessions and recovering from session expiry.
//!
//! A recovery closes the superseded session, opens a new one behind a fresh
//! connect gate, publishes it, and then notifies every [`SessionListener`] in
//! role order: registration before discovery before watches. Re-registering
//! first keeps this process visible to other discoverers while we rebuild our
//! own view.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    error::{RecoveryError, StoreError},
    instance::Namespace,
    metrics,
    session::{ConnectGate, SessionHandle, SharedSession},
    store::{AddWatchMode, Connector, EventSink},
};

/// Order in which listeners hear about a renewed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListenerRole {
    /// recreates this process's own nodes
    Registration,
    /// rebuilds the view of other processes
    Discovery,
    /// re-arms notifications
    Watch,
}

/// A collaborator that must act on every newly published session.
#[async_trait]
pub trait SessionListener: Send + Sync + fmt::Debug {
    /// determines notification order
    fn role(&self) -> ListenerRole;

    /// name used in logs
    fn name(&self) -> &'static str;

    /// Called once per published session, after it reached `Connected`.
    async fn session_renewed(&self, handle: &SessionHandle) -> Result<(), RecoveryError>;
}

/// Re-arms the persistent recursive watch on the namespace.
#[derive(Debug)]
pub struct NamespaceWatch {
    namespace: Namespace,
}

impl NamespaceWatch {
    /// Watch `namespace` and everything beneath it.
    pub fn new(namespace: Namespace) -> Self {
        Self { namespace }
    }
}

#[async_trait]
impl SessionListener for NamespaceWatch {
    fn role(&self) -> ListenerRole {
        ListenerRole::Watch
    }

    fn name(&self) -> &'static str {
        "namespace-watch"
    }

    async fn session_renewed(&self, handle: &SessionHandle) -> Result<(), RecoveryError> {
        let path = self.namespace.path();
        handle
            .add_watch(path, AddWatchMode::PersistentRecursive)
            .await
            .map_err(|source| RecoveryError::Watch {
                path: path.to_owned(),
                source,
            })?;
        info!(
            path,
            generation = handle.generation(),
            "armed persistent recursive watch"
        );
        Ok(())
    }
}

/// Where and how to open sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSettings {
    /// store address, e.g. `zk-1:2181,zk-2:2181`
    pub address: String,
    /// session timeout; also bounds the wait for `Connected`
    pub session_timeout: Duration,
}

/// How often and how patiently a failed recovery is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// attempts in total, at least 1
    pub max_attempts: u32,
    /// delay after the first failure, doubled after every further failure
    pub initial_backoff: Duration,
    /// upper bound on any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff)
    }
}

/// What the coordinator has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStatus {
    /// recovery attempts started
    pub attempts: u64,
    /// recovery attempts that completed
    pub completed: u64,
    /// error of the most recent attempt, cleared by a success
    pub last_error: Option<String>,
    /// the store rejected our credentials; retrying will not help
    pub auth_failed: bool,
}

/// Owns the "current session": the only component that opens and publishes
/// sessions.
pub struct SessionRecoveryCoordinator {
    connector: Arc<dyn Connector>,
    settings: ConnectSettings,
    sink: EventSink,
    session: SharedSession,
    gate: ConnectGate,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    status: Mutex<RecoveryStatus>,
    serial: tokio::sync::Mutex<()>,
}

impl fmt::Debug for SessionRecoveryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecoveryCoordinator")
            .field("settings", &self.settings)
            .field("generation", &self.session.generation())
            .field("listeners", &self.listener_names())
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl SessionRecoveryCoordinator {
    /// Sessions are opened through `connector` and report to `sink`.
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: ConnectSettings,
        session: SharedSession,
        sink: EventSink,
    ) -> Self {
        Self {
            connector,
            settings,
            sink,
            session,
            gate: ConnectGate::new(),
            listeners: RwLock::new(Vec::new()),
            status: Mutex::new(RecoveryStatus::default()),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// the shared current-session cell
    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Add a listener. Listeners stay sorted by role, ties keep insertion order.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        let mut listeners = self.listeners.write();
        debug!(listener = listener.name(), role = ?listener.role(), "adding session listener");
        listeners.push(listener);
        listeners.sort_by_key(|l| l.role());
    }

    /// Listener names in notification order.
    pub fn listener_names(&self) -> Vec<&'static str> {
        self.listeners.read().iter().map(|l| l.name()).collect()
    }

    /// Snapshot of recovery bookkeeping.
    pub fn status(&self) -> RecoveryStatus {
        self.status.lock().clone()
    }

    /// A session reported `Connected`: fire the armed gate, if any.
    pub fn session_connected(&self) -> bool {
        self.gate.release()
    }

    /// A session reported `AuthFailed`. Wakes a pending open with an error.
    pub fn session_auth_failed(&self) {
        self.status.lock().auth_failed = true;
        self.gate.abandon();
    }

    /// Open a session, wait for `Connected`, then publish it.
    ///
    /// A fresh gate is armed for every call. If the session does not connect
    /// within the session timeout it is closed and the gate is dropped.
    pub async fn open_session(&self) -> Result<Arc<SessionHandle>, RecoveryError> {
        let waiter = self.gate.arm();
        let timeout = self.settings.session_timeout;
        let session = self
            .connector
            .connect(&self.settings.address, timeout, self.sink.clone())
            .await
            .map_err(|err| match err {
                StoreError::AuthFailed => RecoveryError::AuthFailed,
                err => RecoveryError::Connect(err),
            })?;
        debug!(
            session_id = session.id(),
            address = %self.settings.address,
            "waiting for session to connect"
        );

        match tokio::time::timeout(timeout, waiter.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                session.close().await;
                return Err(if self.status.lock().auth_failed {
                    RecoveryError::AuthFailed
                } else {
                    RecoveryError::GateAbandoned
                });
            }
            Err(_) => {
                self.gate.abandon();
                session.close().await;
                return Err(RecoveryError::ConnectTimeout(timeout));
            }
        }

        let handle = self.session.publish(session);
        info!(
            generation = handle.generation(),
            session_id = handle.session_id(),
            "session connected"
        );
        Ok(handle)
    }

    /// Notify every listener of `handle`, in role order, stopping at the
    /// first failure.
    pub async fn broadcast(&self, handle: &SessionHandle) -> Result<(), RecoveryError> {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            debug!(
                listener = listener.name(),
                role = ?listener.role(),
                generation = handle.generation(),
                "notifying listener"
            );
            listener.session_renewed(handle).await.map_err(|err| {
                error!(listener = listener.name(), %err, "listener failed on renewed session");
                err
            })?;
        }
        Ok(())
    }

    /// Replace the current session with a new one and bring every listener
    /// back in line with it. Concurrent calls are serialized.
    pub async fn recover(&self) -> Result<Arc<SessionHandle>, RecoveryError> {
        let _serial = self.serial.lock().await;
        metrics::RECOVERIES_STARTED.inc();
        let attempt = {
            let mut status = self.status.lock();
            status.attempts += 1;
            status.attempts
        };
        info!(attempt, "recovering session");

        let result = self.recover_once().await;
        let mut status = self.status.lock();
        match &result {
            Ok(handle) => {
                status.completed += 1;
                status.last_error = None;
                info!(generation = handle.generation(), attempt, "session recovered");
            }
            Err(err) => {
                metrics::RECOVERIES_FAILED.inc();
                status.last_error = Some(err.to_string());
                error!(%err, attempt, "session recovery failed");
            }
        }
        result
    }

    async fn recover_once(&self) -> Result<Arc<SessionHandle>, RecoveryError> {
        if let Ok(superseded) = self.session.current() {
            debug!(
                generation = superseded.generation(),
                session_id = superseded.session_id(),
                "closing superseded session"
            );
            superseded.close().await;
        }
        let handle = self.open_session().await?;
        self.broadcast(&handle).await?;
        Ok(handle)
    }

    /// [`recover`](Self::recover) with exponential backoff between attempts.
    /// Non-retryable failures (auth) return immediately.
    pub async fn recover_with_retry(
        &self,
        policy: &RetryPolicy,
    ) -> Result<Arc<SessionHandle>, RecoveryError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.recover().await {
                Ok(handle) => return Ok(handle),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    return Err(RecoveryError::Exhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    })
                }
                Err(err) => {
                    let delay = policy.backoff(attempt);
                    warn!(%err, attempt, ?delay, "retrying session recovery");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
