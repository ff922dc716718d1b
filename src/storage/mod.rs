//! Job-scoped access to the registry.
//!
//! Every service talks to the registry through [`JobNodeStorage`] using paths
//! relative to the job root (see [`JobNodePath`] for the layout).

pub mod path;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{CoordError, Result};
use crate::registry::{CreateMode, DataChangedEvent, RegistryCenter, TxnOp};

pub use path::JobNodePath;

#[derive(Clone)]
pub struct JobNodeStorage {
    registry: Arc<dyn RegistryCenter>,
    path: JobNodePath,
}

impl std::fmt::Debug for JobNodeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobNodeStorage")
            .field("job_name", &self.path.job_name())
            .field("session", &self.registry.session_id())
            .finish()
    }
}

impl JobNodeStorage {
    pub fn new(registry: Arc<dyn RegistryCenter>, job_name: impl Into<String>) -> Self {
        Self {
            registry,
            path: JobNodePath::new(job_name),
        }
    }

    pub fn job_name(&self) -> &str {
        self.path.job_name()
    }

    pub fn path(&self) -> &JobNodePath {
        &self.path
    }

    pub fn registry(&self) -> &Arc<dyn RegistryCenter> {
        &self.registry
    }

    pub async fn is_job_node_existed(&self, node: &str) -> Result<bool> {
        self.registry.is_existed(&self.path.full_path(node)).await
    }

    pub async fn get_job_node_data(&self, node: &str) -> Result<Option<String>> {
        self.registry.get(&self.path.full_path(node)).await
    }

    pub async fn get_job_node_children_keys(&self, node: &str) -> Result<Vec<String>> {
        self.registry
            .get_children_keys(&self.path.full_path(node))
            .await
    }

    /// Create an empty persistent node unless one is already there.
    pub async fn create_job_node_if_needed(&self, node: &str) -> Result<bool> {
        self.registry
            .create_if_absent(&self.path.full_path(node), "", CreateMode::Persistent)
            .await
    }

    pub async fn create_job_node_if_absent(
        &self,
        node: &str,
        value: &str,
        mode: CreateMode,
    ) -> Result<bool> {
        self.registry
            .create_if_absent(&self.path.full_path(node), value, mode)
            .await
    }

    pub async fn remove_job_node_if_existed(&self, node: &str) -> Result<bool> {
        self.registry.remove(&self.path.full_path(node)).await
    }

    /// Create or overwrite a persistent node.
    pub async fn replace_job_node(&self, node: &str, value: &str) -> Result<()> {
        self.registry.persist(&self.path.full_path(node), value).await
    }

    pub async fn fill_ephemeral_job_node(&self, node: &str, value: &str) -> Result<()> {
        self.registry
            .persist_ephemeral(&self.path.full_path(node), value)
            .await
    }

    /// Run a batch of job-relative operations atomically.
    pub async fn execute_in_transaction(&self, ops: Vec<TxnOp>) -> Result<()> {
        let ops = ops
            .into_iter()
            .map(|op| match op {
                TxnOp::Check(node) => TxnOp::Check(self.path.full_path(&node)),
                TxnOp::Create(node, value) => TxnOp::Create(self.path.full_path(&node), value),
                TxnOp::Update(node, value) => TxnOp::Update(self.path.full_path(&node), value),
                TxnOp::Delete(node) => TxnOp::Delete(self.path.full_path(&node)),
            })
            .collect();
        self.registry.transaction(ops).await
    }

    /// Run `f` while holding the ephemeral latch node `latch`.
    ///
    /// Waiters poll until the latch is free and give up with
    /// [`CoordError::LockTimeout`] after `timeout`. A holder that crashes
    /// releases the latch with its session.
    pub async fn execute_in_latch<F, Fut, T>(
        &self,
        latch: &str,
        owner: &str,
        timeout: Duration,
        poll_interval: Duration,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .create_job_node_if_absent(latch, owner, CreateMode::Ephemeral)
                .await?
            {
                break;
            }
            if Instant::now() >= deadline {
                return Err(CoordError::LockTimeout(self.path.full_path(latch)));
            }
            tokio::time::sleep(poll_interval).await;
        }

        let result = f().await;

        match self.get_job_node_data(latch).await {
            Ok(Some(holder)) if holder == owner => {
                if let Err(e) = self.remove_job_node_if_existed(latch).await {
                    tracing::warn!(job = %self.job_name(), latch, error = %e, "Failed to release latch");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job = %self.job_name(), latch, error = %e, "Failed to read latch holder");
            }
        }
        result
    }

    /// Subscribe to every change under the job root.
    pub async fn watch(&self) -> Result<mpsc::UnboundedReceiver<DataChangedEvent>> {
        self.registry.watch(&self.path.root()).await
    }

    pub async fn registry_time(&self) -> Result<DateTime<Utc>> {
        self.registry.registry_time().await
    }
}
