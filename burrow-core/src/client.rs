//! # ServiceRegistry
//!
//! Wires the registrar, cache, coordinator and router together and runs the
//! start-up sequence:
//!
//! 1. spawn the router so the first `Connected` can be observed
//! 2. open the first session behind the connect gate
//! 3. register this process, full resync, arm the namespace watch
//!
//! After that, structural notifications keep the cache current and session
//! expiry triggers recovery without further involvement from the caller.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    cache::RegistryCache,
    config::RegistryConfig,
    error::StartupError,
    instance::InstanceInfo,
    recovery::{NamespaceWatch, RecoveryStatus, SessionRecoveryCoordinator},
    registrar::Registrar,
    router::{RouterHandle, RouterState, WatchEventRouter},
    session::{SessionHandle, SharedSession},
    store::Connector,
};

/// A registered process and its live view of every other service.
#[derive(Debug)]
pub struct ServiceRegistry {
    config: RegistryConfig,
    registrar: Arc<Registrar>,
    cache: Arc<RegistryCache>,
    coordinator: Arc<SessionRecoveryCoordinator>,
    router: RouterHandle,
    router_task: JoinHandle<()>,
    token: CancellationToken,
}

impl ServiceRegistry {
    /// Connect, register `config.local` and load the registry.
    ///
    /// Fails if the first session cannot be opened or any start-up step is
    /// rejected; nothing is left running in that case.
    pub async fn start(
        config: RegistryConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, StartupError> {
        let shared = SharedSession::new();
        let (sink, events) = mpsc::unbounded_channel();
        let coordinator = Arc::new(SessionRecoveryCoordinator::new(
            connector,
            config.connect.clone(),
            shared.clone(),
            sink,
        ));
        let registrar = Arc::new(Registrar::new(
            shared.clone(),
            config.namespace.clone(),
            config.local.clone(),
        ));
        let cache = Arc::new(RegistryCache::new(shared, config.namespace.clone()));
        coordinator.add_listener(Arc::clone(&registrar) as _);
        coordinator.add_listener(Arc::clone(&cache) as _);
        coordinator.add_listener(Arc::new(NamespaceWatch::new(config.namespace.clone())));

        let token = CancellationToken::new();
        let (router, handle) = WatchEventRouter::new(
            events,
            Arc::clone(&cache),
            Arc::clone(&coordinator),
            config.retry.clone(),
            token.clone(),
        );
        let router_task = router.spawn();

        let registry = Self {
            config,
            registrar,
            cache,
            coordinator,
            router: handle,
            router_task,
            token,
        };
        if let Err(err) = registry.bootstrap().await {
            error!(%err, "registry start-up failed");
            registry.shutdown().await;
            return Err(err);
        }
        Ok(registry)
    }

    async fn bootstrap(&self) -> Result<(), StartupError> {
        info!(
            address = %self.config.connect.address,
            namespace = %self.config.namespace,
            instance = %self.config.local,
            "starting service registry"
        );
        self.router.await_connect();
        let session = self.coordinator.open_session().await?;
        self.coordinator.broadcast(&session).await?;
        info!(
            path = ?self.registrar.registered_path().as_deref(),
            services = self.cache.services().len(),
            instances = self.cache.instance_count(),
            "service registry started"
        );
        self.cache.log_registry();
        Ok(())
    }

    /// settings the registry was started with
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// this process's instance
    pub fn local(&self) -> &InstanceInfo {
        self.registrar.local()
    }

    /// Instances of `service_name`, empty if unknown.
    pub fn lookup(&self, service_name: &str) -> HashSet<InstanceInfo> {
        self.cache.lookup(service_name)
    }

    /// Known service names, sorted.
    pub fn services(&self) -> Vec<String> {
        self.cache.services()
    }

    /// Ordered copy of the whole registry.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, InstanceInfo>> {
        self.cache.snapshot()
    }

    /// the underlying cache
    pub fn cache(&self) -> &Arc<RegistryCache> {
        &self.cache
    }

    /// Router state.
    pub fn state(&self) -> RouterState {
        self.router.state()
    }

    /// Observe router state changes.
    pub fn state_watcher(&self) -> watch::Receiver<RouterState> {
        self.router.watcher()
    }

    /// Path of our instance node on the current session.
    pub fn registered_path(&self) -> Option<Arc<String>> {
        self.registrar.registered_path()
    }

    /// The current session, if one is published.
    pub fn current_session(&self) -> Option<Arc<SessionHandle>> {
        self.coordinator.session().current().ok()
    }

    /// Recovery bookkeeping, useful to decide whether to retry.
    pub fn recovery_status(&self) -> RecoveryStatus {
        self.coordinator.status()
    }

    /// Ask for another recovery after a failed one.
    pub fn retry_recovery(&self) -> bool {
        self.router.trigger_recovery()
    }

    /// Close the session (removing our instance node) and stop the router.
    pub async fn shutdown(self) {
        if let Some(session) = self.coordinator.session().take() {
            info!(
                generation = session.generation(),
                session_id = session.session_id(),
                "closing session"
            );
            session.close().await;
        }
        self.token.cancel();
        if let Err(err) = self.router_task.await {
            error!(?err, "router task failed");
        }
        info!("service registry stopped");
    }
}
