//! Registers this process as an ephemeral-sequential instance node.
//!
//! ```text
//! /namespace/serviceName/serviceName0000000000
//!                       /serviceName0000000001
//! ```
//!
//! Parent nodes are permanent and created on demand. The instance node is
//! ephemeral: when our session dies the store removes it, which is the signal
//! every other discoverer relies on.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::{
    error::{RecoveryError, RegistrationError, StoreError},
    instance::{validate_service_name, InstanceInfo, Namespace},
    metrics,
    recovery::{ListenerRole, SessionListener},
    session::{SessionHandle, SharedSession},
    store::{Acl, CreateMode},
};

/// Creates this process's instance node on the current session.
#[derive(Debug)]
pub struct Registrar {
    session: SharedSession,
    namespace: Namespace,
    local: InstanceInfo,
    registered: ArcSwapOption<String>,
}

impl Registrar {
    /// `local` is the instance re-registered after every recovery.
    pub fn new(session: SharedSession, namespace: Namespace, local: InstanceInfo) -> Self {
        Self {
            session,
            namespace,
            local,
            registered: ArcSwapOption::empty(),
        }
    }

    /// this process's instance
    pub fn local(&self) -> &InstanceInfo {
        &self.local
    }

    /// Path of the node created by the last successful registration.
    pub fn registered_path(&self) -> Option<Arc<String>> {
        self.registered.load_full()
    }

    /// Register this process's own instance.
    pub async fn register_local(&self) -> Result<String, RegistrationError> {
        self.register(&self.local).await
    }

    /// Ensure `/{ns}` and `/{ns}/{service}` exist, then create an
    /// ephemeral-sequential node carrying `info`. Safe to retry; nothing is
    /// visible to other processes until the final create succeeds.
    pub async fn register(&self, info: &InstanceInfo) -> Result<String, RegistrationError> {
        validate_service_name(info.service_name())
            .map_err(|err| RegistrationError::InvalidInstance(err.to_string()))?;
        let payload = info.encode()?;
        let session = self
            .session
            .current()
            .map_err(|_| RegistrationError::NotConnected)?;

        self.ensure_path(&session, self.namespace.path()).await?;
        let service_path = self.namespace.service_path(info.service_name());
        self.ensure_path(&session, &service_path).await?;

        let prefix = self.namespace.instance_prefix(info.service_name());
        let path = session
            .create(
                &prefix,
                Some(&payload),
                Acl::OpenUnsafe,
                CreateMode::EphemeralSequential,
            )
            .await
            .map_err(|source| {
                error!(%prefix, error = %source, "failed to create instance node");
                RegistrationError::Create {
                    prefix: prefix.clone(),
                    source,
                }
            })?;

        if info == &self.local {
            self.registered.store(Some(Arc::new(path.clone())));
        }
        metrics::REGISTRATIONS.inc();
        info!(
            %path,
            instance = %info,
            generation = session.generation(),
            "registered instance"
        );
        Ok(path)
    }

    async fn ensure_path(
        &self,
        session: &SessionHandle,
        path: &str,
    ) -> Result<(), RegistrationError> {
        let to_err = |source| RegistrationError::EnsurePath {
            path: path.to_owned(),
            source,
        };
        if session.exists(path).await.map_err(to_err)?.is_some() {
            return Ok(());
        }
        info!(path, "node missing, creating");
        match session
            .create(path, None, Acl::OpenUnsafe, CreateMode::Persistent)
            .await
        {
            Ok(created) => {
                info!(path = %created, "node created");
                Ok(())
            }
            // someone else won the race
            Err(StoreError::NodeExists(_)) => {
                debug!(path, "node created concurrently");
                Ok(())
            }
            Err(source) => Err(to_err(source)),
        }
    }
}

#[async_trait]
impl SessionListener for Registrar {
    fn role(&self) -> ListenerRole {
        ListenerRole::Registration
    }

    fn name(&self) -> &'static str {
        "registrar"
    }

    async fn session_renewed(&self, handle: &SessionHandle) -> Result<(), RecoveryError> {
        debug!(
            generation = handle.generation(),
            "re-registering on renewed session"
        );
        self.register_local().await?;
        Ok(())
    }
}
