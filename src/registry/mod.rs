//! Registry center contract consumed by the coordination engine.
//!
//! The registry is a hierarchical key/value tree (ZooKeeper-like) that offers:
//! - **Persistent and ephemeral nodes**: ephemeral nodes vanish when the
//!   owning session closes or expires
//! - **Atomic create-if-absent**: the only mutual exclusion primitive the
//!   engine relies on (leadership token, latches)
//! - **Subtree watches**: change events for every node under a prefix
//! - **Session lifecycle**: connection state transitions
//!
//! [`MemoryRegistry`] is the in-process implementation used by tests and
//! single-process deployments.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::error::Result;

pub use memory::{MemoryRegistry, MemorySession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Created => write!(f, "created"),
            ChangeType::Updated => write!(f, "updated"),
            ChangeType::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single node change delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChangedEvent {
    pub change_type: ChangeType,
    pub key: String,
    /// New value for created/updated nodes, last value for deleted ones.
    pub value: String,
}

impl DataChangedEvent {
    pub fn new(change_type: ChangeType, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            change_type,
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Suspended,
    Reconnected,
    Lost,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Suspended => write!(f, "suspended"),
            ConnectionState::Reconnected => write!(f, "reconnected"),
            ConnectionState::Lost => write!(f, "lost"),
        }
    }
}

/// One operation of an atomic [`RegistryCenter::transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Abort the transaction unless the key exists.
    Check(String),
    Create(String, String),
    Update(String, String),
    Delete(String),
}

/// Client session on a registry center.
///
/// Every method may block on the network. Failures surface as
/// [`CoordError::Registry`](crate::error::CoordError::Registry).
#[async_trait]
pub trait RegistryCenter: Send + Sync {
    /// Identifier of this client session, owner of its ephemeral nodes.
    fn session_id(&self) -> u64;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn is_existed(&self, key: &str) -> Result<bool>;

    /// Child names (not full paths), sorted lexically.
    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>>;

    /// Create or overwrite a persistent node, creating missing parents.
    async fn persist(&self, key: &str, value: &str) -> Result<()>;

    /// Overwrite an existing node, failing if it is absent.
    async fn update(&self, key: &str, value: &str) -> Result<()>;

    /// Create or overwrite an ephemeral node owned by this session.
    async fn persist_ephemeral(&self, key: &str, value: &str) -> Result<()>;

    /// Atomically create `key` unless it exists. Returns whether this call
    /// created it.
    async fn create_if_absent(&self, key: &str, value: &str, mode: CreateMode) -> Result<bool>;

    /// Delete `key` and its descendants. Returns whether this call removed it.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Apply all operations atomically or none of them.
    async fn transaction(&self, ops: Vec<TxnOp>) -> Result<()>;

    /// Subscribe to changes of `prefix` and every node below it.
    async fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<DataChangedEvent>>;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Wall clock as seen by the registry.
    async fn registry_time(&self) -> Result<DateTime<Utc>>;
}

/// Parent of a `/`-separated key, `None` for the root and top-level keys.
pub fn parent_key(key: &str) -> Option<&str> {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}
