//! # burrow
//!
//! Service registration and discovery over a ZooKeeper-style coordination
//! store. A process registers itself as an ephemeral-sequential node under
//! `/{namespace}/{service}` and keeps a local, watch-driven view of every
//! other registered instance:
//!
//! - [`registrar::Registrar`] creates our instance node
//! - [`cache::RegistryCache`] holds the view, patched incrementally and
//!   rebuilt by full resync
//! - [`router::WatchEventRouter`] turns notifications into cache updates and
//!   session transitions
//! - [`recovery::SessionRecoveryCoordinator`] replaces expired sessions and
//!   brings every collaborator back in line
//! - [`client::ServiceRegistry`] wires them together
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use async_trait::async_trait;
pub use tokio;
pub use tracing;

pub use crate::{
    cache::RegistryCache,
    client::ServiceRegistry,
    config::RegistryConfig,
    error::{
        ApplyError, CodecError, ConfigError, RecoveryError, RegistrationError, StartupError,
        StoreError, SyncError,
    },
    instance::{InstanceInfo, Namespace},
    recovery::{RetryPolicy, SessionRecoveryCoordinator},
    registrar::Registrar,
    router::{RouterState, WatchEventRouter},
};

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod instance;
pub mod metrics;
pub mod recovery;
pub mod registrar;
pub mod router;
pub mod session;
pub mod store;
