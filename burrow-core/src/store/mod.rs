//! Coordination-store capability consumed by the registry.
//!
//! This mirrors the subset of a ZooKeeper client the registry needs: open a
//! session, check existence, create nodes, list children, read data and add
//! persistent watches. Sessions report state changes and watch firings to the
//! [`EventSink`] they were opened with, in the order they occur.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreResult;

pub mod memory;

/// Identifier the store assigns to a session.
pub type SessionId = u64;

/// Channel every notification of a session is delivered on.
pub type EventSink = mpsc::UnboundedSender<WatchedEvent>;

/// Receiving half of an [`EventSink`].
pub type EventStream = mpsc::UnboundedReceiver<WatchedEvent>;

/// What happened to the watched node. `None` marks a session-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// session state change, `path` is empty
    None,
    /// node created
    NodeCreated,
    /// node deleted
    NodeDeleted,
    /// node payload replaced
    NodeDataChanged,
    /// child list of the node changed
    NodeChildrenChanged,
}

impl EventType {
    /// lower-case name, used as a metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::None => "none",
            EventType::NodeCreated => "node_created",
            EventType::NodeDeleted => "node_deleted",
            EventType::NodeDataChanged => "node_data_changed",
            EventType::NodeChildrenChanged => "node_children_changed",
        }
    }
}

/// Session state carried on every notification. Only meaningful for
/// [`EventType::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeeperState {
    /// handshake in progress
    Connecting,
    /// session established (or re-established)
    Connected,
    /// session expired on the server; ephemerals are gone
    Expired,
    /// session closed by the client
    Closed,
    /// credentials rejected
    AuthFailed,
}

/// A notification delivered to an [`EventSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    /// structural change, or `None` for session-state changes
    pub event_type: EventType,
    /// session state at delivery time
    pub state: KeeperState,
    /// subject of a structural change
    pub path: Option<String>,
}

impl WatchedEvent {
    /// A session-state notification.
    pub fn session(state: KeeperState) -> Self {
        Self {
            event_type: EventType::None,
            state,
            path: None,
        }
    }

    /// A structural notification for `path` on a connected session.
    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            state: KeeperState::Connected,
            path: Some(path.into()),
        }
    }
}

/// Node lifetime and naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// survives the creating session
    Persistent,
    /// removed with the creating session; name gets a store-assigned suffix
    EphemeralSequential,
}

impl CreateMode {
    /// whether nodes of this mode die with their session
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }

    /// whether the store appends a sequence suffix
    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

/// Persistent watch flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddWatchMode {
    /// fires for the node itself and its direct child list
    Persistent,
    /// fires for the node and every descendant
    PersistentRecursive,
}

/// Access control applied to created nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acl {
    /// anyone may do anything
    OpenUnsafe,
}

/// Node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// payload version, bumped on every data change
    pub version: u64,
    /// session owning an ephemeral node
    pub ephemeral_owner: Option<SessionId>,
    /// number of direct children
    pub num_children: usize,
}

/// An open session against the coordination store.
#[async_trait]
pub trait Session: Send + Sync + std::fmt::Debug + 'static {
    /// store-assigned session id
    fn id(&self) -> SessionId;

    /// Metadata of `path`, or `None` if absent.
    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>>;

    /// Create a node. Returns the actual path, which differs from `path` for
    /// sequential modes.
    async fn create(
        &self,
        path: &str,
        data: Option<&[u8]>,
        acl: Acl,
        mode: CreateMode,
    ) -> StoreResult<String>;

    /// Child names of `path`. `watch` leaves a one-shot child watch.
    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>>;

    /// Payload and metadata of `path`. `watch` leaves a one-shot data watch.
    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<(Vec<u8>, Stat)>;

    /// Add a persistent watch on `path`.
    async fn add_watch(&self, path: &str, mode: AddWatchMode) -> StoreResult<()>;

    /// Close the session. Its ephemeral nodes are removed.
    async fn close(&self);
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug + 'static {
    /// Start a session handshake with `address`. The session reports
    /// `Connected` on `sink` once usable.
    async fn connect(
        &self,
        address: &str,
        session_timeout: Duration,
        sink: EventSink,
    ) -> StoreResult<Arc<dyn Session>>;
}
