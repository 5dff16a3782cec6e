//! Local view of every registered service.
//!
//! `service name -> (instance id -> InstanceInfo)`. Two write paths exist:
//! - incremental: [`RegistryCache::apply_create`] / [`RegistryCache::apply_delete`]
//!   driven by structural notifications, mutating the published map in place
//! - full resync: [`RegistryCache::full_resync`] builds a replacement map off to
//!   the side and publishes it with one atomic swap
//!
//! Readers load the published map once per call, so a lookup sees either the
//! old registry or the new one, never a mixture. Incremental mutations made
//! while a resync is in flight are journaled and replayed onto the replacement
//! before it is published, so no processed notification is lost to the swap.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{ApplyError, RecoveryError, StoreError, SyncError},
    instance::{InstanceInfo, InstancePath, Namespace},
    metrics,
    recovery::{ListenerRole, SessionListener},
    session::{SessionHandle, SharedSession},
    store::AddWatchMode,
};

type Instances = DashMap<String, InstanceInfo>;

#[derive(Debug, Default)]
struct Registry {
    services: DashMap<String, Instances>,
}

impl Registry {
    fn instance_count(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    Upsert(InstancePath, InstanceInfo),
    Remove(InstancePath),
}

impl Mutation {
    fn apply(&self, registry: &Registry) -> Option<InstanceInfo> {
        match self {
            Mutation::Upsert(at, info) => registry
                .services
                .entry(at.service_name.clone())
                .or_default()
                .insert(at.instance_id.clone(), info.clone()),
            Mutation::Remove(at) => registry
                .services
                .get(&at.service_name)
                .and_then(|instances| instances.remove(&at.instance_id))
                .map(|(_, info)| info),
        }
    }

    /// change in the instance count once applied with result `prior`
    fn count_delta(&self, prior: Option<&InstanceInfo>) -> i64 {
        match (self, prior) {
            (Mutation::Upsert(..), None) => 1,
            (Mutation::Remove(..), Some(_)) => -1,
            _ => 0,
        }
    }
}

/// The authoritative local registry.
#[derive(Debug)]
pub struct RegistryCache {
    session: SharedSession,
    namespace: Namespace,
    current: ArcSwap<Registry>,
    // Some(..) while a resync is building its replacement
    journal: Mutex<Option<Vec<Mutation>>>,
    resync: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl RegistryCache {
    /// Empty cache reading through `session`.
    pub fn new(session: SharedSession, namespace: Namespace) -> Self {
        Self {
            session,
            namespace,
            current: ArcSwap::from_pointee(Registry::default()),
            journal: Mutex::new(None),
            resync: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// the namespace this cache mirrors
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Snapshot of every instance of `service_name`; empty if unknown. The
    /// returned set is owned, later mutations do not show through.
    pub fn lookup(&self, service_name: &str) -> HashSet<InstanceInfo> {
        let registry = self.current.load();
        registry
            .services
            .get(service_name)
            .map(|instances| {
                instances
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Known service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let registry = self.current.load();
        let mut names: Vec<String> = registry
            .services
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Ordered, owned copy of the whole registry.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, InstanceInfo>> {
        let registry = self.current.load();
        registry
            .services
            .iter()
            .map(|service| {
                let instances = service
                    .value()
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect();
                (service.key().clone(), instances)
            })
            .collect()
    }

    /// Number of cached instances across all services.
    pub fn instance_count(&self) -> usize {
        self.current.load().instance_count()
    }

    /// Number of registries published by full resync.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Dump the registry at debug level.
    pub fn log_registry(&self) {
        for (service, instances) in self.snapshot() {
            debug!(%service, count = instances.len(), "registry service");
            for (id, info) in instances {
                debug!(%service, %id, instance = %info, "registry instance");
            }
        }
    }

    fn mutate(&self, mutation: Mutation) -> Option<InstanceInfo> {
        let mut journal = self.journal.lock();
        let prior = mutation.apply(&self.current.load());
        metrics::CACHED_INSTANCES.add(mutation.count_delta(prior.as_ref()));
        if let Some(pending) = journal.as_mut() {
            pending.push(mutation);
        }
        prior
    }

    /// Fetch the node at `path` and insert it under `(service, instance id)`.
    ///
    /// A malformed path or a node that vanished before the read leaves the
    /// cache unchanged and returns an error for the caller to log; the next
    /// full resync repairs any drift. A payload that is not an instance
    /// evicts whatever was cached for the node, as a full resync would.
    pub async fn apply_create(&self, path: &str) -> Result<InstanceInfo, ApplyError> {
        let at = self.namespace.parse_instance(path)?;
        let session = self
            .session
            .current()
            .map_err(|_| ApplyError::NotConnected)?;
        let (data, _) =
            session
                .get_data(path, false)
                .await
                .map_err(|source| ApplyError::FetchFailed {
                    path: path.to_owned(),
                    source,
                })?;
        let info = match InstanceInfo::decode(&data) {
            Ok(info) => info,
            Err(source) => {
                if let Some(stale) = self.mutate(Mutation::Remove(at)) {
                    metrics::INSTANCES_REMOVED.inc();
                    debug!(path, instance = %stale, "evicted instance with an unreadable payload");
                }
                return Err(ApplyError::Undecodable {
                    path: path.to_owned(),
                    source,
                });
            }
        };
        let prior = self.mutate(Mutation::Upsert(at, info.clone()));
        if prior.is_none() {
            metrics::INSTANCES_ADDED.inc();
        }
        trace!(path, instance = %info, replaced = prior.is_some(), "applied create");
        Ok(info)
    }

    /// Remove the entry for `path`, returning it if it was cached. Malformed
    /// paths and unknown services are no-ops.
    pub fn apply_delete(&self, path: &str) -> Option<InstanceInfo> {
        let at = match self.namespace.parse_instance(path) {
            Ok(at) => at,
            Err(err) => {
                debug!(%err, "ignoring delete");
                return None;
            }
        };
        let prior = self.mutate(Mutation::Remove(at));
        if prior.is_some() {
            metrics::INSTANCES_REMOVED.inc();
        }
        trace!(path, removed = prior.is_some(), "applied delete");
        prior
    }

    /// Rebuild the registry from a fresh listing of the namespace and publish
    /// it atomically. Concurrent resyncs are serialized.
    ///
    /// The persistent recursive namespace watch is armed before the listing,
    /// so a change the listing misses is still notified. Nodes that vanish
    /// between listing and fetch are skipped; the deletion notification that
    /// follows is a no-op.
    pub async fn full_resync(&self) -> Result<(), SyncError> {
        let _serial = self.resync.lock().await;
        let session = self
            .session
            .current()
            .map_err(|_| SyncError::NotConnected)?;
        self.begin_resync();
        match self.build(&session).await {
            Ok(registry) => {
                self.publish(registry);
                Ok(())
            }
            Err(err) => {
                self.journal.lock().take();
                metrics::RESYNC_FAILURES.inc();
                error!(%err, namespace = %self.namespace, "full resync failed");
                Err(err)
            }
        }
    }

    fn begin_resync(&self) {
        *self.journal.lock() = Some(Vec::new());
    }

    async fn build(&self, session: &SessionHandle) -> Result<Registry, SyncError> {
        let registry = Registry::default();
        let ns = self.namespace.path();
        session
            .add_watch(ns, AddWatchMode::PersistentRecursive)
            .await
            .map_err(|source| SyncError::Watch {
                path: ns.to_owned(),
                source,
            })?;
        let services = match session.get_children(ns, false).await {
            Ok(services) => services,
            Err(StoreError::NoNode(_)) => {
                debug!(namespace = ns, "namespace absent, registry is empty");
                return Ok(registry);
            }
            Err(source) => {
                return Err(SyncError::List {
                    path: ns.to_owned(),
                    source,
                })
            }
        };

        for service in services {
            let service_path = self.namespace.service_path(&service);
            let ids = match session.get_children(&service_path, false).await {
                Ok(ids) => ids,
                Err(StoreError::NoNode(_)) => {
                    debug!(path = %service_path, "service vanished during resync");
                    continue;
                }
                Err(source) => {
                    return Err(SyncError::List {
                        path: service_path,
                        source,
                    })
                }
            };
            let fetched = try_join_all(
                ids.into_iter()
                    .map(|id| self.fetch_instance(session, &service, id)),
            )
            .await?;
            let instances: Instances = fetched.into_iter().flatten().collect();
            registry.services.insert(service, instances);
        }
        Ok(registry)
    }

    async fn fetch_instance(
        &self,
        session: &SessionHandle,
        service: &str,
        id: String,
    ) -> Result<Option<(String, InstanceInfo)>, SyncError> {
        let path = self.namespace.instance_path(service, &id);
        let data = match session.get_data(&path, false).await {
            Ok((data, _)) => data,
            Err(StoreError::NoNode(_)) => {
                debug!(%path, "instance vanished during resync");
                return Ok(None);
            }
            Err(source) => return Err(SyncError::Fetch { path, source }),
        };
        match InstanceInfo::decode(&data) {
            Ok(info) => Ok(Some((id, info))),
            Err(err) => {
                warn!(%path, %err, "skipping node without an instance payload");
                Ok(None)
            }
        }
    }

    fn publish(&self, registry: Registry) {
        let mut journal = self.journal.lock();
        let replayed = journal.take().unwrap_or_default();
        for mutation in &replayed {
            mutation.apply(&registry);
        }
        let count = registry.instance_count();
        let services = registry.services.len();
        self.current.store(Arc::new(registry));
        // incremental deltas are applied under the same lock
        metrics::CACHED_INSTANCES.set(count as i64);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        drop(journal);

        metrics::RESYNCS.inc();
        info!(
            generation,
            services,
            instances = count,
            replayed = replayed.len(),
            "published registry"
        );
    }
}

#[async_trait]
impl SessionListener for RegistryCache {
    fn role(&self) -> ListenerRole {
        ListenerRole::Discovery
    }

    fn name(&self) -> &'static str {
        "registry-cache"
    }

    async fn session_renewed(&self, handle: &SessionHandle) -> Result<(), RecoveryError> {
        debug!(generation = handle.generation(), "resyncing on renewed session");
        self.full_resync().await?;
        self.log_registry();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use tracing_test::traced_test;

    use super::*;
    use crate::store::{
        memory::MemoryStore, Acl, Connector, CreateMode, EventType, Session, WatchedEvent,
    };

    fn info(service: &str, last: u8) -> InstanceInfo {
        InstanceInfo::new(service, Ipv4Addr::new(10, 0, 0, last), 8080)
    }

    struct Fixture {
        store: MemoryStore,
        session: Arc<dyn Session>,
        cache: Arc<RegistryCache>,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = MemoryStore::new();
            let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
            let session = store
                .connect("memory", Duration::from_secs(1), tx)
                .await
                .unwrap();
            let shared = SharedSession::new();
            shared.publish(Arc::clone(&session));
            store.create("/service", None, CreateMode::Persistent).unwrap();
            let cache = Arc::new(RegistryCache::new(
                shared,
                Namespace::new("/service").unwrap(),
            ));
            Self {
                store,
                session,
                cache,
            }
        }

        async fn add(&self, info: &InstanceInfo) -> String {
            let service_path = format!("/service/{}", info.service_name());
            if !self.store.contains(&service_path) {
                self.store
                    .create(&service_path, None, CreateMode::Persistent)
                    .unwrap();
            }
            self.session
                .create(
                    &format!("{service_path}/{}", info.service_name()),
                    Some(&info.encode().unwrap()),
                    Acl::OpenUnsafe,
                    CreateMode::EphemeralSequential,
                )
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_apply_create_and_delete() {
        let fx = Fixture::new().await;
        let a = info("order-service", 5);
        let path = fx.add(&a).await;

        assert_eq!(fx.cache.apply_create(&path).await.unwrap(), a);
        assert_eq!(
            fx.cache.lookup("order-service"),
            HashSet::from([a.clone()])
        );
        assert_eq!(fx.cache.apply_delete(&path), Some(a));
        assert!(fx.cache.lookup("order-service").is_empty());
        assert_eq!(fx.cache.apply_delete(&path), None);
    }

    #[tokio::test]
    async fn test_replay_in_store_order() {
        let fx = Fixture::new().await;
        let a = info("order-service", 5);
        let path = fx.add(&a).await;

        // create, delete, create again for the same instance id
        fx.cache.apply_create(&path).await.unwrap();
        fx.cache.apply_delete(&path);
        fx.cache.apply_create(&path).await.unwrap();
        assert_eq!(fx.cache.lookup("order-service").len(), 1);
        fx.cache.apply_delete(&path);
        assert!(fx.cache.lookup("order-service").is_empty());
    }

    #[tokio::test]
    async fn test_malformed_paths_are_no_ops() {
        let fx = Fixture::new().await;
        let a = info("order-service", 5);
        let path = fx.add(&a).await;
        fx.cache.apply_create(&path).await.unwrap();
        let before = fx.cache.snapshot();

        // a node of the same shape outside the namespace
        fx.store.create("/other", None, CreateMode::Persistent).unwrap();
        fx.store.create("/other/a", None, CreateMode::Persistent).unwrap();
        fx.store
            .create("/other/a/a0", Some(&info("a", 1).encode().unwrap()), CreateMode::Persistent)
            .unwrap();

        let below_instance = format!("{path}/child");
        for bad in [
            "/service",
            "/service/order-service",
            "",
            "/",
            "/other/a/a0",
            below_instance.as_str(),
        ] {
            assert!(matches!(
                fx.cache.apply_create(bad).await,
                Err(ApplyError::MalformedPath(_))
            ));
            assert_eq!(fx.cache.apply_delete(bad), None);
        }
        assert_eq!(fx.cache.snapshot(), before);
    }

    #[tokio::test]
    async fn test_unreadable_payload_evicts_cached_instance() {
        let fx = Fixture::new().await;
        let a = info("order-service", 5);
        let path = fx.add(&a).await;
        fx.cache.apply_create(&path).await.unwrap();

        fx.store.set_data(&path, b"not json").unwrap();
        assert!(matches!(
            fx.cache.apply_create(&path).await,
            Err(ApplyError::Undecodable { .. })
        ));
        assert!(fx.cache.lookup("order-service").is_empty());
        assert_eq!(fx.cache.instance_count(), 0);

        // a readable payload brings it back
        fx.store.set_data(&path, &a.encode().unwrap()).unwrap();
        assert_eq!(fx.cache.apply_create(&path).await.unwrap(), a);
    }

    #[test]
    fn test_instance_count_deltas() {
        let at = InstancePath {
            service_name: "order-service".into(),
            instance_id: "order-service0000000000".into(),
        };
        let a = info("order-service", 5);
        let upsert = Mutation::Upsert(at.clone(), a.clone());
        let remove = Mutation::Remove(at);
        assert_eq!(upsert.count_delta(None), 1);
        assert_eq!(upsert.count_delta(Some(&a)), 0);
        assert_eq!(remove.count_delta(Some(&a)), -1);
        assert_eq!(remove.count_delta(None), 0);

        // the deltas track the registry they are applied to
        let registry = Registry::default();
        let mut count = 0;
        for mutation in [&upsert, &upsert, &remove, &remove, &upsert] {
            let prior = mutation.apply(&registry);
            count += mutation.count_delta(prior.as_ref());
            assert_eq!(count, registry.instance_count() as i64);
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_delete_for_unknown_service() {
        let fx = Fixture::new().await;
        assert_eq!(
            fx.cache
                .apply_delete("/service/never-seen/never-seen0000000000"),
            None
        );
        assert!(fx.cache.services().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_or_name_only_node_is_dropped() {
        let fx = Fixture::new().await;
        let a = info("order-service", 5);
        let path = fx.add(&a).await;
        fx.store.delete(&path).unwrap();
        assert!(matches!(
            fx.cache.apply_create(&path).await,
            Err(ApplyError::FetchFailed { source: StoreError::NoNode(_), .. })
        ));

        fx.store
            .create("/service/order-service/bare", None, CreateMode::Persistent)
            .unwrap();
        assert!(matches!(
            fx.cache.apply_create("/service/order-service/bare").await,
            Err(ApplyError::Undecodable { .. })
        ));
        assert!(fx.cache.lookup("order-service").is_empty());
    }

    #[tokio::test]
    async fn test_lookup_returns_a_detached_snapshot() {
        let fx = Fixture::new().await;
        let a = info("order-service", 5);
        let path = fx.add(&a).await;
        fx.cache.apply_create(&path).await.unwrap();

        let seen = fx.cache.lookup("order-service");
        fx.cache.apply_delete(&path);
        assert_eq!(seen.len(), 1);
        assert!(fx.cache.lookup("order-service").is_empty());
        assert!(fx.cache.lookup("unknown").is_empty());
    }

    #[tokio::test]
    async fn test_full_resync_matches_store() {
        let fx = Fixture::new().await;
        let a = info("order-service", 5);
        let b = info("order-service", 6);
        let c = info("user-service", 7);
        fx.add(&a).await;
        let b_path = fx.add(&b).await;
        fx.add(&c).await;
        // stale entry that no longer exists in the store
        let gone = info("gone-service", 9);
        let gone_path = fx.add(&gone).await;
        fx.cache.apply_create(&gone_path).await.unwrap();
        fx.store.delete(&gone_path).unwrap();
        // name-only node is skipped, not fatal
        fx.store
            .create("/service/user-service/bare", None, CreateMode::Persistent)
            .unwrap();

        fx.cache.full_resync().await.unwrap();
        assert_eq!(fx.cache.generation(), 1);
        assert_eq!(
            fx.cache.lookup("order-service"),
            HashSet::from([a.clone(), b.clone()])
        );
        assert_eq!(fx.cache.lookup("user-service"), HashSet::from([c]));
        assert!(fx.cache.lookup("gone-service").is_empty());
        assert_eq!(fx.cache.instance_count(), 3);
        assert_eq!(
            fx.cache.snapshot()["order-service"].get("order-service0000000001"),
            Some(&b)
        );
        assert_eq!(b_path, "/service/order-service/order-service0000000001");
    }

    #[tokio::test]
    async fn test_full_resync_without_namespace_is_empty() {
        let store = MemoryStore::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = SharedSession::new();
        shared.publish(store.connect("memory", Duration::from_secs(1), tx).await.unwrap());
        let cache = RegistryCache::new(shared, Namespace::new("/service").unwrap());
        cache.full_resync().await.unwrap();
        assert!(cache.services().is_empty());
    }

    #[tokio::test]
    async fn test_full_resync_arms_namespace_watch() {
        let store = MemoryStore::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = SharedSession::new();
        shared.publish(store.connect("memory", Duration::from_secs(1), tx).await.unwrap());
        let cache = RegistryCache::new(shared, Namespace::new("/service").unwrap());
        cache.full_resync().await.unwrap();

        // created after the listing, still notified
        let created = "/service/user-service/user-service0000000000";
        store.create("/service", None, CreateMode::Persistent).unwrap();
        store
            .create("/service/user-service", None, CreateMode::Persistent)
            .unwrap();
        store
            .create(created, Some(&info("user-service", 9).encode().unwrap()), CreateMode::Persistent)
            .unwrap();
        let notified = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(event) = rx.recv().await {
                if event == WatchedEvent::node(EventType::NodeCreated, created) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(notified);
        assert_eq!(cache.apply_create(created).await.unwrap(), info("user-service", 9));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_resync_keeps_previous_registry() {
        let fx = Fixture::new().await;
        let a = info("order-service", 5);
        fx.add(&a).await;
        fx.cache.full_resync().await.unwrap();

        fx.store.set_available(false);
        assert!(matches!(
            fx.cache.full_resync().await,
            Err(SyncError::Watch { .. })
        ));
        assert_eq!(fx.cache.lookup("order-service"), HashSet::from([a]));
        assert_eq!(fx.cache.generation(), 1);
        assert!(fx.cache.journal.lock().is_none());
        assert!(logs_contain("full resync failed"));
    }

    #[tokio::test]
    async fn test_resync_without_session() {
        let cache = RegistryCache::new(SharedSession::new(), Namespace::new("/service").unwrap());
        assert!(matches!(
            cache.full_resync().await,
            Err(SyncError::NotConnected)
        ));
        assert!(matches!(
            cache
                .apply_create("/service/a/a0000000000")
                .await,
            Err(ApplyError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_mutations_during_resync_are_replayed() {
        let fx = Fixture::new().await;
        let a = info("order-service", 5);
        let a_path = fx.add(&a).await;

        fx.cache.begin_resync();
        let session = fx.cache.session.current().unwrap();
        let built = fx.cache.build(&session).await.unwrap();

        // store changes after the listing, notifications processed before publish
        fx.store.delete(&a_path).unwrap();
        fx.cache.apply_delete(&a_path);
        let b = info("user-service", 6);
        let b_path = fx.add(&b).await;
        fx.cache.apply_create(&b_path).await.unwrap();

        fx.cache.publish(built);
        assert!(fx.cache.lookup("order-service").is_empty());
        assert_eq!(fx.cache.lookup("user-service"), HashSet::from([b]));
        assert!(fx.cache.journal.lock().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_a_mixed_registry() {
        let fx = Fixture::new().await;
        for i in 0..20u8 {
            fx.add(&info(&format!("old-{i}"), i)).await;
        }
        fx.cache.full_resync().await.unwrap();

        for i in 0..20u8 {
            let service = format!("old-{i}");
            for id in fx.store.children_of(&format!("/service/{service}")) {
                fx.store.delete(&format!("/service/{service}/{id}")).unwrap();
            }
            fx.store.delete(&format!("/service/{service}")).unwrap();
            fx.add(&info(&format!("new-{i}"), i)).await;
        }

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&fx.cache);
                let stop = Arc::clone(&stop);
                tokio::spawn(async move {
                    let mut reads = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let names = cache.services();
                        assert_eq!(names.len(), 20);
                        let old = names.iter().filter(|n| n.starts_with("old-")).count();
                        assert!(old == 0 || old == 20, "mixed registry: {names:?}");
                        reads += 1;
                        tokio::task::yield_now().await;
                    }
                    reads
                })
            })
            .collect();

        for _ in 0..10 {
            fx.cache.full_resync().await.unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
        assert!(fx.cache.services().iter().all(|n| n.starts_with("new-")));
    }
}
