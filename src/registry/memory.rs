use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{CoordError, Result};
use crate::registry::{
    parent_key, ChangeType, ConnectionState, CreateMode, DataChangedEvent, RegistryCenter, TxnOp,
};

#[derive(Debug, Clone)]
struct NodeEntry {
    value: String,
    /// Owning session of an ephemeral node.
    owner: Option<u64>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    session: u64,
    tx: mpsc::UnboundedSender<DataChangedEvent>,
}

impl Watcher {
    fn matches(&self, key: &str) -> bool {
        key == self.prefix
            || (key.starts_with(&self.prefix) && key[self.prefix.len()..].starts_with('/'))
            || self.prefix == "/"
    }
}

#[derive(Debug, Default)]
struct Store {
    nodes: BTreeMap<String, NodeEntry>,
    watchers: Vec<Watcher>,
}

impl Store {
    fn descendants(&self, key: &str) -> Vec<String> {
        let prefix = format!("{}/", key.trim_end_matches('/'));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn children(&self, key: &str) -> Vec<String> {
        let prefix = format!("{}/", key.trim_end_matches('/'));
        let mut result: Vec<String> = self
            .descendants(key)
            .into_iter()
            .filter_map(|k| {
                let rest = &k[prefix.len()..];
                if rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        result.sort();
        result
    }

    fn ensure_parents(&mut self, key: &str, events: &mut Vec<DataChangedEvent>) {
        let mut missing = Vec::new();
        let mut current = parent_key(key);
        while let Some(parent) = current {
            if self.nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            current = parent_key(parent);
        }
        for parent in missing.into_iter().rev() {
            self.nodes.insert(
                parent.clone(),
                NodeEntry {
                    value: String::new(),
                    owner: None,
                },
            );
            events.push(DataChangedEvent::new(ChangeType::Created, parent, ""));
        }
    }

    fn put(
        &mut self,
        key: &str,
        value: &str,
        owner: Option<u64>,
        events: &mut Vec<DataChangedEvent>,
    ) {
        self.ensure_parents(key, events);
        let change_type = if self.nodes.contains_key(key) {
            ChangeType::Updated
        } else {
            ChangeType::Created
        };
        self.nodes.insert(
            key.to_string(),
            NodeEntry {
                value: value.to_string(),
                owner,
            },
        );
        events.push(DataChangedEvent::new(change_type, key, value));
    }

    fn delete(&mut self, key: &str, events: &mut Vec<DataChangedEvent>) -> bool {
        if !self.nodes.contains_key(key) {
            return false;
        }
        let mut doomed = self.descendants(key);
        // Deepest first so watchers never see a child outlive its parent.
        doomed.sort_by_key(|k| std::cmp::Reverse(k.len()));
        doomed.push(key.to_string());
        for k in doomed {
            if let Some(entry) = self.nodes.remove(&k) {
                events.push(DataChangedEvent::new(ChangeType::Deleted, k, entry.value));
            }
        }
        true
    }

    fn remove_ephemerals_of(&mut self, session: u64, events: &mut Vec<DataChangedEvent>) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for key in owned {
            self.delete(&key, events);
        }
    }

    fn dispatch(&mut self, events: Vec<DataChangedEvent>) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|w| !w.tx.is_closed());
        for event in events {
            for watcher in self.watchers.iter().filter(|w| w.matches(&event.key)) {
                let _ = watcher.tx.send(event.clone());
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    store: Mutex<Store>,
    next_session: AtomicU64,
    clock_offset_ms: AtomicI64,
    unavailable: AtomicBool,
}

/// Shared in-process registry tree. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client session.
    pub fn session(&self) -> Arc<MemorySession> {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Arc::new(MemorySession {
            registry: self.clone(),
            id: AtomicU64::new(id),
            closed: AtomicBool::new(false),
            state_tx,
        })
    }

    /// Shift the registry clock relative to the local wall clock.
    pub fn set_clock_offset(&self, offset: chrono::Duration) {
        self.inner
            .clock_offset_ms
            .store(offset.num_milliseconds(), Ordering::SeqCst);
    }

    /// Simulate an outage: every call fails until availability is restored.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Snapshot of every node and its value, for diagnostics and tests.
    pub async fn dump(&self) -> BTreeMap<String, String> {
        let store = self.inner.store.lock().await;
        store
            .nodes
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    fn next_session_id(&self) -> u64 {
        self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(CoordError::Registry("registry unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

/// A client session on a [`MemoryRegistry`].
#[derive(Debug)]
pub struct MemorySession {
    registry: MemoryRegistry,
    id: AtomicU64,
    closed: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
}

impl MemorySession {
    fn current_id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    async fn store(&self) -> Result<tokio::sync::MutexGuard<'_, Store>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::Registry(format!(
                "session {} is closed",
                self.current_id()
            )));
        }
        self.registry.check_available()?;
        Ok(self.registry.inner.store.lock().await)
    }

    /// Drop the session as a crashed process would: ephemeral nodes vanish
    /// and this session's watches stop.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.current_id();
        let mut store = self.registry.inner.store.lock().await;
        let mut events = Vec::new();
        store.remove_ephemerals_of(session, &mut events);
        store.dispatch(events);
        store.watchers.retain(|w| w.session != session);
        drop(store);
        self.state_tx.send_replace(ConnectionState::Lost);
    }

    /// Expire the session and transparently open a new one. Ephemeral nodes
    /// of the old session are gone when `Reconnected` is observed.
    pub async fn expire(&self) {
        self.state_tx.send_replace(ConnectionState::Lost);
        let old = self.current_id();
        {
            let mut store = self.registry.inner.store.lock().await;
            let mut events = Vec::new();
            store.remove_ephemerals_of(old, &mut events);
            let new_id = self.registry.next_session_id();
            for watcher in store.watchers.iter_mut().filter(|w| w.session == old) {
                watcher.session = new_id;
            }
            self.id.store(new_id, Ordering::SeqCst);
            store.dispatch(events);
        }
        tracing::info!(old_session = old, new_session = self.current_id(), "Session expired");
        self.state_tx.send_replace(ConnectionState::Reconnected);
    }

    /// Temporarily lose the connection without losing the session.
    pub fn suspend(&self) {
        self.state_tx.send_replace(ConnectionState::Suspended);
    }

    pub fn resume(&self) {
        self.state_tx.send_replace(ConnectionState::Reconnected);
    }
}

#[async_trait]
impl RegistryCenter for MemorySession {
    fn session_id(&self) -> u64 {
        self.current_id()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let store = self.store().await?;
        Ok(store.nodes.get(key).map(|n| n.value.clone()))
    }

    async fn is_existed(&self, key: &str) -> Result<bool> {
        let store = self.store().await?;
        Ok(store.nodes.contains_key(key))
    }

    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>> {
        let store = self.store().await?;
        Ok(store.children(key))
    }

    async fn persist(&self, key: &str, value: &str) -> Result<()> {
        let mut store = self.store().await?;
        let mut events = Vec::new();
        store.put(key, value, None, &mut events);
        store.dispatch(events);
        Ok(())
    }

    async fn update(&self, key: &str, value: &str) -> Result<()> {
        let mut store = self.store().await?;
        let owner = match store.nodes.get(key) {
            Some(entry) => entry.owner,
            None => {
                return Err(CoordError::Registry(format!("node '{}' does not exist", key)));
            }
        };
        let mut events = Vec::new();
        store.put(key, value, owner, &mut events);
        store.dispatch(events);
        Ok(())
    }

    async fn persist_ephemeral(&self, key: &str, value: &str) -> Result<()> {
        let session = self.current_id();
        let mut store = self.store().await?;
        let mut events = Vec::new();
        store.put(key, value, Some(session), &mut events);
        store.dispatch(events);
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: &str, mode: CreateMode) -> Result<bool> {
        let session = self.current_id();
        let mut store = self.store().await?;
        if store.nodes.contains_key(key) {
            return Ok(false);
        }
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session),
        };
        let mut events = Vec::new();
        store.put(key, value, owner, &mut events);
        store.dispatch(events);
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut store = self.store().await?;
        let mut events = Vec::new();
        let removed = store.delete(key, &mut events);
        store.dispatch(events);
        Ok(removed)
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> Result<()> {
        let mut store = self.store().await?;
        for op in &ops {
            let (key, must_exist) = match op {
                TxnOp::Check(key) | TxnOp::Update(key, _) | TxnOp::Delete(key) => (key, true),
                TxnOp::Create(key, _) => (key, false),
            };
            if store.nodes.contains_key(key.as_str()) != must_exist {
                return Err(CoordError::Registry(format!(
                    "transaction aborted on {:?}",
                    op
                )));
            }
        }
        let mut events = Vec::new();
        for op in ops {
            match op {
                TxnOp::Check(_) => {}
                TxnOp::Create(key, value) => {
                    store.put(&key, &value, None, &mut events);
                }
                TxnOp::Update(key, value) => {
                    let owner = store.nodes.get(key.as_str()).and_then(|entry| entry.owner);
                    store.put(&key, &value, owner, &mut events);
                }
                TxnOp::Delete(key) => {
                    store.delete(&key, &mut events);
                }
            }
        }
        store.dispatch(events);
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<DataChangedEvent>> {
        let session = self.current_id();
        let mut store = self.store().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        store.watchers.push(Watcher {
            prefix: prefix.trim_end_matches('/').to_string(),
            session,
            tx,
        });
        Ok(rx)
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn registry_time(&self) -> Result<DateTime<Utc>> {
        self.registry.check_available()?;
        let offset = self.registry.inner.clock_offset_ms.load(Ordering::SeqCst);
        Ok(Utc::now() + chrono::Duration::milliseconds(offset))
    }
}
