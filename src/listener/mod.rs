//! Reactive side of the engine.
//!
//! Every job owns one [`ListenerManager`] task that consumes the job's subtree
//! watch and its session's connection state, and hands each change to the
//! registered [`ChangeHandler`]s one at a time. Handlers of one job therefore
//! never run concurrently or out of order with each other, while different
//! jobs progress independently.
//!
//! Events only say *that* something changed. Handlers re-read registry state
//! before acting on anything that matters.

pub mod handlers;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::{ConnectionState, DataChangedEvent};
use crate::storage::JobNodeStorage;

pub use handlers::{
    ConfigChangedHandler, ConnectionStateHandler, FailoverHandler, LeaderElectionHandler,
    MembershipChangedHandler, ShutdownHandler, TriggerHandler,
};

/// A node change below a job root, with the path made job-relative.
#[derive(Debug, Clone, Copy)]
pub struct JobChange<'a> {
    /// Path relative to the job root, e.g. `instances/10.0.0.1@-@42`.
    pub path: &'a str,
    pub event: &'a DataChangedEvent,
}

/// Reaction to node changes under one job.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_change(&self, change: JobChange<'_>) -> Result<()>;
}

/// Reaction to session state transitions.
#[async_trait]
pub trait StateHandler: Send + Sync {
    async fn on_state(&self, state: ConnectionState) -> Result<()>;
}

pub struct ListenerManager {
    storage: JobNodeStorage,
    handlers: Vec<Arc<dyn ChangeHandler>>,
    state_handler: Option<Arc<dyn StateHandler>>,
}

impl std::fmt::Debug for ListenerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerManager")
            .field("job", &self.storage.job_name())
            .field(
                "handlers",
                &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ListenerManager {
    pub fn new(storage: JobNodeStorage) -> Self {
        Self {
            storage,
            handlers: Vec::new(),
            state_handler: None,
        }
    }

    pub fn add_handler(mut self, handler: Arc<dyn ChangeHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_state_handler(mut self, handler: Arc<dyn StateHandler>) -> Self {
        self.state_handler = Some(handler);
        self
    }

    /// Subscribe and spawn the consumer task.
    ///
    /// The subscription is in place when this returns, so no change made
    /// afterwards is missed.
    pub async fn start(self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let events = self.storage.watch().await?;
        let states = self.storage.registry().connection_state();
        Ok(tokio::spawn(self.run(events, states, cancel)))
    }

    async fn run(
        self,
        mut events: tokio::sync::mpsc::UnboundedReceiver<DataChangedEvent>,
        mut states: tokio::sync::watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        let job = self.storage.job_name().to_string();
        tracing::debug!(job = %job, handlers = self.handlers.len(), "Listener started");
        let mut states_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = states.changed(), if states_open => {
                    if changed.is_err() {
                        // Session dropped; node changes may still arrive.
                        states_open = false;
                        continue;
                    }
                    let state = *states.borrow_and_update();
                    self.dispatch_state(state).await;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!(job = %job, "Watch closed, listener stopping");
                        break;
                    };
                    self.dispatch(&event).await;
                }
            }
        }
        tracing::debug!(job = %job, "Listener stopped");
    }

    async fn dispatch(&self, event: &DataChangedEvent) {
        let Some(path) = self.storage.path().relative(&event.key) else {
            return;
        };
        let change = JobChange { path, event };
        for handler in &self.handlers {
            if let Err(e) = handler.on_change(change).await {
                tracing::warn!(
                    job = %self.storage.job_name(),
                    handler = handler.name(),
                    path,
                    change = %event.change_type,
                    error = %e,
                    "Change handler failed"
                );
            }
        }
    }

    async fn dispatch_state(&self, state: ConnectionState) {
        tracing::info!(job = %self.storage.job_name(), state = %state, "Connection state changed");
        if let Some(handler) = &self.state_handler {
            if let Err(e) = handler.on_state(state).await {
                tracing::error!(
                    job = %self.storage.job_name(),
                    state = %state,
                    error = %e,
                    "Connection state handler failed"
                );
            }
        }
    }
}
