//! Consumes session notifications in delivery order.
//!
//! Session-state changes drive a small state machine:
//!
//! ```text
//! Disconnected --await_connect--> AwaitingFirstConnect --connected--> Connected
//! Connected --expired--> Recovering --recovered--> Connected
//! Recovering --expired, then recovered--> Recovering
//! any --closed / recovery failed--> Disconnected
//! ```
//!
//! Structural notifications under the namespace are applied to the
//! [`RegistryCache`] one at a time, so updates for one instance are never
//! reordered. Recovery runs on its own task: it needs this loop to keep
//! draining notifications, the `Connected` that releases its gate among them.

use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    cache::RegistryCache,
    error::RecoveryError,
    instance::Namespace,
    metrics,
    recovery::{RetryPolicy, SessionRecoveryCoordinator},
    store::{EventStream, EventType, KeeperState, WatchedEvent},
};

/// Where the router believes the current session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterState {
    /// no usable session
    Disconnected,
    /// the first handshake is in progress
    AwaitingFirstConnect,
    /// session established
    Connected,
    /// a recovery task is replacing an expired session
    Recovering,
}

#[derive(Debug)]
enum Command {
    AwaitConnect,
    Recover,
}

/// Cloneable handle to a running router.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<RouterState>,
}

impl RouterHandle {
    /// current state
    pub fn state(&self) -> RouterState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watcher(&self) -> watch::Receiver<RouterState> {
        self.state.clone()
    }

    /// Announce that the first handshake is starting.
    pub fn await_connect(&self) -> bool {
        self.commands.send(Command::AwaitConnect).is_ok()
    }

    /// Ask for a recovery, e.g. after a previous one failed. Ignored while
    /// one is already running.
    pub fn trigger_recovery(&self) -> bool {
        self.commands.send(Command::Recover).is_ok()
    }
}

/// Single consumer of a session event stream.
#[derive(Debug)]
pub struct WatchEventRouter {
    events: EventStream,
    commands: mpsc::UnboundedReceiver<Command>,
    cache: Arc<RegistryCache>,
    coordinator: Arc<SessionRecoveryCoordinator>,
    namespace: Namespace,
    retry: RetryPolicy,
    state: watch::Sender<RouterState>,
    recovered_tx: mpsc::UnboundedSender<Result<u64, RecoveryError>>,
    recovered_rx: mpsc::UnboundedReceiver<Result<u64, RecoveryError>>,
    // the replacement session expired before its recovery reported back
    expired_during_recovery: bool,
    token: CancellationToken,
}

impl WatchEventRouter {
    /// Create a router over `events`. Nothing runs until [`spawn`](Self::spawn)
    /// or [`run`](Self::run).
    pub fn new(
        events: EventStream,
        cache: Arc<RegistryCache>,
        coordinator: Arc<SessionRecoveryCoordinator>,
        retry: RetryPolicy,
        token: CancellationToken,
    ) -> (Self, RouterHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(RouterState::Disconnected);
        let (recovered_tx, recovered_rx) = mpsc::unbounded_channel();
        let namespace = cache.namespace().clone();
        let router = Self {
            events,
            commands,
            cache,
            coordinator,
            namespace,
            retry,
            state,
            recovered_tx,
            recovered_rx,
            expired_during_recovery: false,
            token,
        };
        let handle = RouterHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (router, handle)
    }

    /// Run on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands, recovery outcomes and notifications until cancelled.
    pub async fn run(mut self) {
        info!(namespace = %self.namespace, "watch event router started");
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!("router cancelled");
                    break;
                }
                Some(command) = self.commands.recv() => self.on_command(command),
                Some(outcome) = self.recovered_rx.recv() => self.on_recovery_outcome(outcome),
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        info!("event stream closed");
                        break;
                    }
                },
            }
        }
        self.transition(RouterState::Disconnected);
        info!("watch event router stopped");
    }

    fn current(&self) -> RouterState {
        *self.state.borrow()
    }

    fn transition(&self, to: RouterState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(?from, ?to, "router state changed");
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::AwaitConnect => self.transition(RouterState::AwaitingFirstConnect),
            Command::Recover if self.current() == RouterState::Recovering => {
                debug!("recovery already in progress");
            }
            Command::Recover => self.start_recovery(),
        }
    }

    fn start_recovery(&mut self) {
        self.expired_during_recovery = false;
        self.transition(RouterState::Recovering);
        let coordinator = Arc::clone(&self.coordinator);
        let retry = self.retry.clone();
        let tx = self.recovered_tx.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = coordinator.recover_with_retry(&retry) => {
                    let _ = tx.send(result.map(|handle| handle.generation()));
                }
            }
        });
    }

    fn on_recovery_outcome(&mut self, outcome: Result<u64, RecoveryError>) {
        match outcome {
            Ok(generation) if self.expired_during_recovery => {
                warn!(generation, "recovered session already expired, recovering again");
                self.start_recovery();
            }
            Ok(generation) => {
                info!(generation, "recovery complete, resuming incremental updates");
                self.transition(RouterState::Connected);
            }
            Err(err) => {
                self.expired_during_recovery = false;
                error!(%err, "recovery failed, registry will not update until a retry succeeds");
                self.transition(RouterState::Disconnected);
            }
        }
    }

    async fn on_event(&mut self, event: WatchedEvent) {
        metrics::EVENTS_RECEIVED
            .with_label_values(&[event.event_type.as_str()])
            .inc();
        trace!(?event, "notification received");

        // state first: structural notifications carry a session state too
        self.on_session_state(event.state, event.event_type == EventType::None);
        if let Some(path) = event.path.as_deref() {
            self.on_structural(event.event_type, path).await;
        }
    }

    fn on_session_state(&mut self, state: KeeperState, session_event: bool) {
        match state {
            // only an explicit session notification may fire the gate
            KeeperState::Connected if !session_event => {}
            KeeperState::Connected => {
                let state = self.current();
                if state == RouterState::AwaitingFirstConnect {
                    self.transition(RouterState::Connected);
                }
                // state is published before the opener is woken
                let released = self.coordinator.session_connected();
                match state {
                    RouterState::AwaitingFirstConnect => {}
                    RouterState::Connected => trace!(released, "already connected"),
                    state => debug!(released, ?state, "session connected"),
                }
            }
            KeeperState::Connecting => trace!("session connecting"),
            KeeperState::Expired => match self.current() {
                RouterState::Connected => {
                    warn!("session expired, starting recovery");
                    self.start_recovery();
                }
                RouterState::Recovering => {
                    warn!("session expired while recovering, will recover again");
                    self.expired_during_recovery = true;
                }
                state => debug!(?state, "ignoring expiry of a superseded session"),
            },
            KeeperState::Closed => match self.current() {
                RouterState::Recovering => {
                    debug!("ignoring close of a superseded session");
                }
                _ => {
                    info!("session closed");
                    self.transition(RouterState::Disconnected);
                }
            },
            KeeperState::AuthFailed => {
                error!("authentication failed, this is fatal and will not be retried");
                self.coordinator.session_auth_failed();
            }
        }
    }

    fn schedule_resync(&self) {
        if self.current() == RouterState::Recovering {
            // recovery ends with a full resync anyway
            return;
        }
        let cache = Arc::clone(&self.cache);
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                res = cache.full_resync() => {
                    if res.is_ok() {
                        info!("registry repaired after a dropped update");
                    }
                }
            }
        });
    }

    async fn on_structural(&self, event_type: EventType, path: &str) {
        if !self.namespace.contains(path) {
            trace!(path, "outside namespace");
            return;
        }
        match event_type {
            EventType::NodeCreated | EventType::NodeDataChanged => {
                if self.namespace.parse_instance(path).is_err() {
                    trace!(path, ?event_type, "not an instance node");
                    return;
                }
                match self.cache.apply_create(path).await {
                    Ok(info) => debug!(path, instance = %info, "instance added"),
                    Err(err) => {
                        metrics::DROPPED_UPDATES.inc();
                        warn!(%err, path, "dropped update, next full resync repairs it");
                        if err.needs_resync() {
                            self.schedule_resync();
                        }
                    }
                }
            }
            EventType::NodeDeleted => match self.cache.apply_delete(path) {
                Some(info) => debug!(path, instance = %info, "instance removed"),
                None => trace!(path, "delete for an uncached node"),
            },
            EventType::NodeChildrenChanged => debug!(path, "children changed"),
            EventType::None => {}
        }
    }
}
