//! Error types for registration, discovery and session recovery.
//!
//! Each stage of the registry has its own error so callers can tell a bad
//! notification (absorbed, self-healing) from a failed registration or resync
//! (surfaced, the instance may be invisible to other discoverers).

use std::time::Duration;

use thiserror::Error;

/// Failure reported by the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The node does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// A node already exists at the path.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// The node still has children.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    /// The session backing the call has expired.
    #[error("session expired")]
    SessionExpired,

    /// The session backing the call was closed.
    #[error("session closed")]
    SessionClosed,

    /// Lost the connection to the store while the call was in flight.
    #[error("connection loss: {0}")]
    ConnectionLoss(String),

    /// The store did not answer within its own read/connect timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Authentication was rejected by the store.
    #[error("authentication failed")]
    AuthFailed,
}

impl StoreError {
    /// Returns true for failures that may succeed when retried, possibly on a
    /// fresh session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLoss(_) | StoreError::Timeout(_) | StoreError::SessionExpired
        )
    }
}

/// Shorthand result alias for coordination store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Payload encode/decode failure.
#[derive(Debug, Error)]
#[error("instance codec error: {0}")]
pub struct CodecError(#[from] pub serde_json::Error);

/// Missing or invalid settings. Fatal at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required setting was not provided or is empty.
    #[error("required setting '{0}' is not configured")]
    Missing(&'static str),

    /// A setting was provided but cannot be used.
    #[error("setting '{key}' is invalid: {reason}")]
    Invalid {
        /// setting name
        key: &'static str,
        /// why it was rejected
        reason: String,
    },
}

/// Registration of this process's instance node failed.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// No session has been published yet.
    #[error("no active session")]
    NotConnected,

    /// Checking for or creating a permanent parent node failed.
    #[error("failed to ensure parent node '{path}': {source}")]
    EnsurePath {
        /// parent node path
        path: String,
        /// store failure
        #[source]
        source: StoreError,
    },

    /// The ephemeral-sequential instance node was rejected.
    #[error("failed to create instance node under '{prefix}': {source}")]
    Create {
        /// requested node prefix
        prefix: String,
        /// store failure
        #[source]
        source: StoreError,
    },

    /// The instance could not be serialized.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The instance is not valid for this namespace.
    #[error("invalid instance: {0}")]
    InvalidInstance(String),
}

/// A single structural notification could not be applied to the cache.
///
/// These are logged and dropped; the next full resync repairs the cache.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The path does not have the `/{namespace}/{service}/{instance}` shape.
    #[error("malformed instance path: {0}")]
    MalformedPath(String),

    /// The node vanished or could not be read.
    #[error("failed to fetch '{path}': {source}")]
    FetchFailed {
        /// instance node path
        path: String,
        /// store failure
        #[source]
        source: StoreError,
    },

    /// The node carries no instance payload (or a foreign one).
    #[error("undecodable payload at '{path}': {source}")]
    Undecodable {
        /// instance node path
        path: String,
        /// codec failure
        #[source]
        source: CodecError,
    },

    /// No session has been published yet.
    #[error("no active session")]
    NotConnected,
}

impl ApplyError {
    /// Returns true if the cache may now be missing an update that no later
    /// notification will repair. A vanished node is followed by its delete
    /// notification and a missing session by a recovery resync, so neither
    /// qualifies.
    pub fn needs_resync(&self) -> bool {
        match self {
            ApplyError::FetchFailed { source, .. } => !matches!(source, StoreError::NoNode(_)),
            ApplyError::MalformedPath(_) | ApplyError::Undecodable { .. } => false,
            ApplyError::NotConnected => false,
        }
    }
}

/// A full resync could not build a replacement registry.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No session has been published yet.
    #[error("no active session")]
    NotConnected,

    /// Arming the namespace watch ahead of the listing failed.
    #[error("failed to watch '{path}': {source}")]
    Watch {
        /// watched path
        path: String,
        /// store failure
        #[source]
        source: StoreError,
    },

    /// Listing children failed.
    #[error("failed to list children of '{path}': {source}")]
    List {
        /// listed path
        path: String,
        /// store failure
        #[source]
        source: StoreError,
    },

    /// Fetching an instance payload failed for a reason other than the node
    /// having vanished mid-scan.
    #[error("failed to fetch '{path}': {source}")]
    Fetch {
        /// instance node path
        path: String,
        /// store failure
        #[source]
        source: StoreError,
    },
}

/// Any step of opening or recovering a session failed.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The connector refused to open a session.
    #[error("failed to open session: {0}")]
    Connect(#[source] StoreError),

    /// The session never reported `connected`.
    #[error("session did not connect within {0:?}")]
    ConnectTimeout(Duration),

    /// The connect gate was dropped before it fired.
    #[error("connect gate abandoned before the session connected")]
    GateAbandoned,

    /// The store rejected our credentials.
    #[error("authentication failed")]
    AuthFailed,

    /// Re-registering this process failed.
    #[error("re-registration failed: {0}")]
    Register(#[from] RegistrationError),

    /// Rebuilding the registry failed.
    #[error("full resync failed: {0}")]
    Resync(#[from] SyncError),

    /// Re-arming the namespace watch failed.
    #[error("failed to watch namespace '{path}': {source}")]
    Watch {
        /// namespace path
        path: String,
        /// store failure
        #[source]
        source: StoreError,
    },

    /// Every attempt allowed by the retry policy failed.
    #[error("recovery failed after {attempts} attempt(s): {last}")]
    Exhausted {
        /// attempts made
        attempts: u32,
        /// error from the final attempt
        #[source]
        last: Box<RecoveryError>,
    },
}

impl RecoveryError {
    /// Returns true if retrying with a fresh session may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RecoveryError::Connect(err) => err.is_retryable(),
            RecoveryError::ConnectTimeout(_) | RecoveryError::GateAbandoned => true,
            RecoveryError::AuthFailed | RecoveryError::Exhausted { .. } => false,
            RecoveryError::Register(RegistrationError::Codec(_))
            | RecoveryError::Register(RegistrationError::InvalidInstance(_)) => false,
            RecoveryError::Register(_) | RecoveryError::Resync(_) | RecoveryError::Watch { .. } => {
                true
            }
        }
    }
}

/// Start-up of the registry failed. The process should not proceed.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Opening the first session, registering, resyncing or watching failed.
    #[error(transparent)]
    Session(#[from] RecoveryError),
}
