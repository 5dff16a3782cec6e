//! In-process coordination store.
//!
//! Implements the node, session and watch semantics of a ZooKeeper ensemble
//! closely enough to drive the registry end to end: persistent and
//! ephemeral-sequential nodes, one-shot data/child watches, persistent and
//! persistent-recursive watches. Notifications are pushed to session sinks
//! while the tree lock is held, so per-path delivery order always matches
//! mutation order.
//!
//! The control surface (`expire_session`, `set_available`, `reject_auth`, ...)
//! lets tests and the standalone binary simulate other processes and faults.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    error::{StoreError, StoreResult},
    store::{
        Acl, AddWatchMode, Connector, CreateMode, EventSink, EventStream, EventType, KeeperState,
        Session, SessionId, Stat, WatchedEvent,
    },
};

const ROOT: &str = "/";

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,
    version: u64,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
    // bumped on every child create; sequential suffixes come from here
    cversion: u64,
}

#[derive(Debug)]
struct SessionEntry {
    sink: EventSink,
    state: KeeperState,
    persistent: Vec<(String, AddWatchMode)>,
    data_watches: HashSet<String>,
    child_watches: HashSet<String>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_session: SessionId,
    available: bool,
    reject_auth: bool,
    delay_connected: bool,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_owned(), Node::default());
        Self {
            nodes,
            sessions: HashMap::new(),
            next_session: 1,
            available: true,
            reject_auth: false,
            delay_connected: false,
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return path != ROOT;
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn validate_path(path: &str) -> StoreResult<()> {
    if path == ROOT {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(StoreError::NoNode(path.to_owned()));
    }
    Ok(())
}

impl Tree {
    fn check_session(&self, id: SessionId) -> StoreResult<()> {
        if !self.available {
            return Err(StoreError::ConnectionLoss("store unavailable".into()));
        }
        match self.sessions.get(&id).map(|s| s.state) {
            Some(KeeperState::Connected) => Ok(()),
            Some(KeeperState::Expired) => Err(StoreError::SessionExpired),
            Some(KeeperState::Closed) | None => Err(StoreError::SessionClosed),
            Some(KeeperState::AuthFailed) => Err(StoreError::AuthFailed),
            Some(KeeperState::Connecting) => Err(StoreError::ConnectionLoss(
                "session not yet connected".into(),
            )),
        }
    }

    fn stat(node: &Node) -> Stat {
        Stat {
            version: node.version,
            ephemeral_owner: node.ephemeral_owner,
            num_children: node.children.len(),
        }
    }

    /// Deliver `event_type` for `path` to every connected session watching it.
    /// A session receives at most one notification per mutation.
    fn fire(&mut self, event_type: EventType, path: &str) {
        for (id, session) in self.sessions.iter_mut() {
            if session.state != KeeperState::Connected {
                continue;
            }
            let mut deliver = false;
            match event_type {
                EventType::NodeCreated | EventType::NodeDataChanged => {
                    deliver |= session.data_watches.remove(path);
                }
                EventType::NodeDeleted => {
                    deliver |= session.data_watches.remove(path);
                    deliver |= session.child_watches.remove(path);
                }
                EventType::NodeChildrenChanged => {
                    deliver |= session.child_watches.remove(path);
                }
                EventType::None => {}
            }
            deliver |= session.persistent.iter().any(|(watched, mode)| match mode {
                AddWatchMode::Persistent => watched == path,
                AddWatchMode::PersistentRecursive => {
                    event_type != EventType::NodeChildrenChanged
                        && (watched == path || is_descendant(path, watched))
                }
            });
            if deliver {
                trace!(session = id, ?event_type, path, "delivering watch event");
                let _ = session.sink.send(WatchedEvent::node(event_type, path));
            }
        }
    }

    fn create(
        &mut self,
        owner: SessionId,
        path: &str,
        data: Option<&[u8]>,
        mode: CreateMode,
    ) -> StoreResult<String> {
        validate_path(path)?;
        if path == ROOT {
            return Err(StoreError::NodeExists(path.to_owned()));
        }
        let parent_path = parent_of(path).to_owned();
        let parent = self
            .nodes
            .get_mut(&parent_path)
            .ok_or_else(|| StoreError::NoNode(parent_path.clone()))?;
        if parent.ephemeral_owner.is_some() {
            return Err(StoreError::NoChildrenForEphemerals(parent_path));
        }
        let actual = if mode.is_sequential() {
            format!("{path}{:010}", parent.cversion)
        } else {
            path.to_owned()
        };
        if self.nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists(actual));
        }
        // re-borrow after the lookup above
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.insert(name_of(&actual).to_owned());
            parent.cversion += 1;
        }
        self.nodes.insert(
            actual.clone(),
            Node {
                data: data.map(<[u8]>::to_vec).unwrap_or_default(),
                ephemeral_owner: mode.is_ephemeral().then_some(owner),
                ..Default::default()
            },
        );
        self.fire(EventType::NodeCreated, &actual);
        self.fire(EventType::NodeChildrenChanged, &parent_path);
        Ok(actual)
    }

    fn delete(&mut self, path: &str) -> StoreResult<()> {
        validate_path(path)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_owned()))?;
        if path == ROOT || !node.children.is_empty() {
            return Err(StoreError::NotEmpty(path.to_owned()));
        }
        self.nodes.remove(path);
        let parent_path = parent_of(path).to_owned();
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.remove(name_of(path));
        }
        self.fire(EventType::NodeDeleted, path);
        self.fire(EventType::NodeChildrenChanged, &parent_path);
        Ok(())
    }

    fn set_data(&mut self, path: &str, data: &[u8]) -> StoreResult<Stat> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_owned()))?;
        node.data = data.to_vec();
        node.version += 1;
        let stat = Self::stat(node);
        self.fire(EventType::NodeDataChanged, path);
        Ok(stat)
    }

    /// End a session: drop its ephemerals (notifying everyone else), then tell
    /// the owner.
    fn end_session(&mut self, id: SessionId, state: KeeperState) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if matches!(session.state, KeeperState::Expired | KeeperState::Closed) {
            return false;
        }
        session.state = state;
        session.persistent.clear();
        session.data_watches.clear();
        session.child_watches.clear();
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            let _ = self.delete(&path);
        }
        if let Some(session) = self.sessions.get(&id) {
            let _ = session.sink.send(WatchedEvent::session(state));
        }
        true
    }
}

/// Shared, cloneable handle to one in-memory ensemble.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryStore {
    /// Empty store containing only `/`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire a session as the server would after missing heartbeats. Its
    /// ephemeral nodes are deleted and it receives `Expired`. Returns false if
    /// the session was unknown or already over.
    pub fn expire_session(&self, id: SessionId) -> bool {
        debug!(session = id, "expiring session");
        self.tree.lock().end_session(id, KeeperState::Expired)
    }

    /// Close a session from the server side.
    pub fn close_session(&self, id: SessionId) -> bool {
        self.tree.lock().end_session(id, KeeperState::Closed)
    }

    /// While false, every call and every connect fails with `ConnectionLoss`.
    pub fn set_available(&self, available: bool) {
        self.tree.lock().available = available;
    }

    /// While true, new sessions are told `AuthFailed` instead of `Connected`.
    pub fn reject_auth(&self, reject: bool) {
        self.tree.lock().reject_auth = reject;
    }

    /// While true, new sessions stay `Connecting` until [`release_connected`].
    ///
    /// [`release_connected`]: MemoryStore::release_connected
    pub fn delay_connected(&self, delay: bool) {
        self.tree.lock().delay_connected = delay;
    }

    /// Move every `Connecting` session to `Connected` and notify it.
    pub fn release_connected(&self) -> usize {
        let mut tree = self.tree.lock();
        let mut released = 0;
        for session in tree.sessions.values_mut() {
            if session.state == KeeperState::Connecting {
                session.state = KeeperState::Connected;
                let _ = session.sink.send(WatchedEvent::session(KeeperState::Connected));
                released += 1;
            }
        }
        released
    }

    /// Create a node on behalf of no particular session (always persistent
    /// unless `mode` says otherwise, owned by session 0).
    pub fn create(&self, path: &str, data: Option<&[u8]>, mode: CreateMode) -> StoreResult<String> {
        self.tree.lock().create(0, path, data, mode)
    }

    /// Delete a childless node, as another process would.
    pub fn delete(&self, path: &str) -> StoreResult<()> {
        self.tree.lock().delete(path)
    }

    /// Replace a node's payload.
    pub fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<Stat> {
        self.tree.lock().set_data(path, data)
    }

    /// Whether `path` exists.
    pub fn contains(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }

    /// Child names of `path`, sorted. Empty if absent.
    pub fn children_of(&self, path: &str) -> Vec<String> {
        self.tree
            .lock()
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.tree.lock().nodes.len()
    }

    /// State of a session, if it was ever opened.
    pub fn session_state(&self, id: SessionId) -> Option<KeeperState> {
        self.tree.lock().sessions.get(&id).map(|s| s.state)
    }

    /// Open a session for a simulated peer process, returning it with its
    /// notification stream.
    pub async fn open_peer(&self) -> StoreResult<(Arc<dyn Session>, EventStream)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.connect("memory", Duration::from_secs(2), tx).await?;
        Ok((session, rx))
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(
        &self,
        address: &str,
        session_timeout: Duration,
        sink: EventSink,
    ) -> StoreResult<Arc<dyn Session>> {
        let mut tree = self.tree.lock();
        if !tree.available {
            return Err(StoreError::ConnectionLoss(format!(
                "cannot reach '{address}'"
            )));
        }
        let id = tree.next_session;
        tree.next_session += 1;
        let state = if tree.reject_auth {
            KeeperState::AuthFailed
        } else if tree.delay_connected {
            KeeperState::Connecting
        } else {
            KeeperState::Connected
        };
        if state != KeeperState::Connecting {
            let _ = sink.send(WatchedEvent::session(state));
        }
        tree.sessions.insert(
            id,
            SessionEntry {
                sink,
                state,
                persistent: Vec::new(),
                data_watches: HashSet::new(),
                child_watches: HashSet::new(),
            },
        );
        debug!(session = id, address, ?session_timeout, ?state, "memory session opened");
        Ok(Arc::new(MemorySession {
            id,
            tree: Arc::clone(&self.tree),
        }))
    }
}

/// A session against a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    tree: Arc<Mutex<Tree>>,
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>> {
        let tree = self.tree.lock();
        tree.check_session(self.id)?;
        Ok(tree.nodes.get(path).map(Tree::stat))
    }

    async fn create(
        &self,
        path: &str,
        data: Option<&[u8]>,
        _acl: Acl,
        mode: CreateMode,
    ) -> StoreResult<String> {
        // every node is open; acls are not enforced here
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        tree.create(self.id, path, data, mode)
    }

    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        let children = tree
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect::<Vec<_>>())
            .ok_or_else(|| StoreError::NoNode(path.to_owned()))?;
        if watch {
            if let Some(session) = tree.sessions.get_mut(&self.id) {
                session.child_watches.insert(path.to_owned());
            }
        }
        Ok(children)
    }

    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<(Vec<u8>, Stat)> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        let found = tree
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), Tree::stat(node)))
            .ok_or_else(|| StoreError::NoNode(path.to_owned()))?;
        if watch {
            if let Some(session) = tree.sessions.get_mut(&self.id) {
                session.data_watches.insert(path.to_owned());
            }
        }
        Ok(found)
    }

    async fn add_watch(&self, path: &str, mode: AddWatchMode) -> StoreResult<()> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        validate_path(path)?;
        if let Some(session) = tree.sessions.get_mut(&self.id) {
            if !session.persistent.iter().any(|(p, m)| p == path && *m == mode) {
                session.persistent.push((path.to_owned(), mode));
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.tree.lock().end_session(self.id, KeeperState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(store: &MemoryStore) -> (Arc<dyn Session>, EventStream) {
        let (session, mut rx) = store.open_peer().await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(WatchedEvent::session(KeeperState::Connected))
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_persistent_and_sequential_nodes() {
        let store = MemoryStore::new();
        let (session, _rx) = connected(&store).await;

        let path = session
            .create("/service", None, Acl::OpenUnsafe, CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(path, "/service");
        assert_eq!(
            session
                .create("/service", None, Acl::OpenUnsafe, CreateMode::Persistent)
                .await,
            Err(StoreError::NodeExists("/service".into()))
        );
        session
            .create("/service/a", None, Acl::OpenUnsafe, CreateMode::Persistent)
            .await
            .unwrap();
        let first = session
            .create("/service/a/a", Some(b"1"), Acl::OpenUnsafe, CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = session
            .create("/service/a/a", Some(b"2"), Acl::OpenUnsafe, CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(first, "/service/a/a0000000000");
        assert_eq!(second, "/service/a/a0000000001");

        let (data, stat) = session.get_data(&second, false).await.unwrap();
        assert_eq!(data, b"2");
        assert_eq!(stat.ephemeral_owner, Some(session.id()));
        assert_eq!(
            session.get_children("/service/a", false).await.unwrap(),
            vec!["a0000000000".to_owned(), "a0000000001".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_sequence_is_never_reused() {
        let store = MemoryStore::new();
        let (session, _rx) = connected(&store).await;
        store.create("/s", None, CreateMode::Persistent).unwrap();
        let first = session
            .create("/s/x", None, Acl::OpenUnsafe, CreateMode::EphemeralSequential)
            .await
            .unwrap();
        store.delete(&first).unwrap();
        let second = session
            .create("/s/x", None, Acl::OpenUnsafe, CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let (session, _rx) = connected(&store).await;
        assert_eq!(
            session
                .create("/missing/a", None, Acl::OpenUnsafe, CreateMode::Persistent)
                .await,
            Err(StoreError::NoNode("/missing".into()))
        );
        let eph = session
            .create("/e", None, Acl::OpenUnsafe, CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert!(matches!(
            session
                .create(&format!("{eph}/child"), None, Acl::OpenUnsafe, CreateMode::Persistent)
                .await,
            Err(StoreError::NoChildrenForEphemerals(_))
        ));
    }

    #[tokio::test]
    async fn test_recursive_watch_sees_descendants_only_once() {
        let store = MemoryStore::new();
        let (watcher, mut rx) = connected(&store).await;
        store.create("/service", None, CreateMode::Persistent).unwrap();
        watcher
            .add_watch("/service", AddWatchMode::PersistentRecursive)
            .await
            .unwrap();
        watcher
            .add_watch("/service", AddWatchMode::PersistentRecursive)
            .await
            .unwrap();

        store.create("/service/a", None, CreateMode::Persistent).unwrap();
        store.set_data("/service/a", b"x").unwrap();
        store.delete("/service/a").unwrap();
        store.create("/other", None, CreateMode::Persistent).unwrap();

        assert_eq!(
            rx.recv().await,
            Some(WatchedEvent::node(EventType::NodeCreated, "/service/a"))
        );
        assert_eq!(
            rx.recv().await,
            Some(WatchedEvent::node(EventType::NodeDataChanged, "/service/a"))
        );
        assert_eq!(
            rx.recv().await,
            Some(WatchedEvent::node(EventType::NodeDeleted, "/service/a"))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_one_shot_child_watch() {
        let store = MemoryStore::new();
        let (watcher, mut rx) = connected(&store).await;
        store.create("/service", None, CreateMode::Persistent).unwrap();
        watcher.get_children("/service", true).await.unwrap();
        store.create("/service/a", None, CreateMode::Persistent).unwrap();
        store.create("/service/b", None, CreateMode::Persistent).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(WatchedEvent::node(EventType::NodeChildrenChanged, "/service"))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expire_removes_ephemerals_and_notifies() {
        let store = MemoryStore::new();
        let (owner, mut owner_rx) = connected(&store).await;
        let (watcher, mut watcher_rx) = connected(&store).await;
        store.create("/service", None, CreateMode::Persistent).unwrap();
        let node = owner
            .create("/service/a", None, Acl::OpenUnsafe, CreateMode::EphemeralSequential)
            .await
            .unwrap();
        watcher
            .add_watch("/service", AddWatchMode::PersistentRecursive)
            .await
            .unwrap();

        assert!(store.expire_session(owner.id()));
        assert!(!store.expire_session(owner.id()));
        assert!(!store.contains(&node));
        assert_eq!(
            watcher_rx.recv().await,
            Some(WatchedEvent::node(EventType::NodeDeleted, node.clone()))
        );
        assert_eq!(
            owner_rx.recv().await,
            Some(WatchedEvent::session(KeeperState::Expired))
        );
        assert_eq!(
            owner.exists("/service").await,
            Err(StoreError::SessionExpired)
        );
        assert_eq!(store.session_state(owner.id()), Some(KeeperState::Expired));
    }

    #[tokio::test]
    async fn test_availability_and_auth() {
        let store = MemoryStore::new();
        let (session, _rx) = connected(&store).await;
        store.set_available(false);
        assert!(matches!(
            session.exists("/").await,
            Err(StoreError::ConnectionLoss(_))
        ));
        assert!(store.open_peer().await.is_err());
        store.set_available(true);

        store.reject_auth(true);
        let (rejected, mut rx) = store.open_peer().await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(WatchedEvent::session(KeeperState::AuthFailed))
        );
        assert_eq!(rejected.exists("/").await, Err(StoreError::AuthFailed));
    }

    #[tokio::test]
    async fn test_delayed_connect() {
        let store = MemoryStore::new();
        store.delay_connected(true);
        let (session, mut rx) = store.open_peer().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(session.exists("/").await.is_err());
        assert_eq!(store.release_connected(), 1);
        assert_eq!(
            rx.recv().await,
            Some(WatchedEvent::session(KeeperState::Connected))
        );
        assert!(session.exists("/").await.unwrap().is_some());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_of("/service"), "/");
        assert_eq!(parent_of("/service/a"), "/service");
        assert_eq!(name_of("/service/a"), "a");
        assert!(is_descendant("/service/a/b", "/service"));
        assert!(!is_descendant("/services", "/service"));
        assert!(is_descendant("/a", "/"));
    }
}
