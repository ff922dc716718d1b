//! Leader election over the registry's atomic create-if-absent.
//!
//! The leadership token is the ephemeral node `leader/election/instance`
//! holding the leader's instance id. Whoever creates it leads; when the
//! leader's session ends the node vanishes and every available instance
//! contends again. At most one holder exists at any time because node
//! creation is atomic in the registry.

pub mod timer;

use std::sync::Arc;
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::instance::ServerService;
use crate::registry::CreateMode;
use crate::runtime::JobRuntime;
use crate::storage::path::LEADER_ELECTION_INSTANCE;
use crate::storage::JobNodeStorage;

use timer::election_backoff;

#[derive(Debug, Clone)]
pub struct LeaderService {
    storage: JobNodeStorage,
    servers: Arc<ServerService>,
    runtime: Arc<JobRuntime>,
    config: CoordinatorConfig,
}

impl LeaderService {
    pub fn new(
        storage: JobNodeStorage,
        servers: Arc<ServerService>,
        runtime: Arc<JobRuntime>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            storage,
            servers,
            runtime,
            config,
        }
    }

    /// Try to take the leadership token if nobody holds it.
    ///
    /// Idempotent. Instances on disabled or unavailable servers never
    /// contend. Returns whether this instance leads afterwards.
    pub async fn elect_if_needed(&self) -> Result<bool> {
        if self.runtime.is_shutdown() {
            return Ok(false);
        }
        if !self
            .servers
            .is_available_server(self.servers.local_ip())
            .await?
        {
            return self.is_leader().await;
        }

        let created = self
            .storage
            .create_job_node_if_absent(
                LEADER_ELECTION_INSTANCE,
                self.runtime.instance_id(),
                CreateMode::Ephemeral,
            )
            .await?;
        if created {
            tracing::info!(
                job = %self.runtime.job_name(),
                instance_id = %self.runtime.instance_id(),
                "Became leader"
            );
        }
        self.is_leader().await
    }

    /// Current holder of the leadership token.
    pub async fn leader_id(&self) -> Result<Option<String>> {
        self.storage
            .get_job_node_data(LEADER_ELECTION_INSTANCE)
            .await
    }

    pub async fn has_leader(&self) -> Result<bool> {
        self.storage
            .is_job_node_existed(LEADER_ELECTION_INSTANCE)
            .await
    }

    /// Whether this instance holds the token right now. Does not wait.
    pub async fn is_leader(&self) -> Result<bool> {
        if self.runtime.is_shutdown() {
            return Ok(false);
        }
        Ok(self.leader_id().await?.as_deref() == Some(self.runtime.instance_id()))
    }

    /// Whether this instance leads, first waiting for the election to settle.
    ///
    /// While no leader exists and some server is available, retries election
    /// with jittered backoff up to `election_max_attempts` times. Transient
    /// registry failures inside the loop are retried, not returned.
    pub async fn is_leader_until_block(&self) -> Result<bool> {
        let base_ms = self.config.election_retry_interval_ms;
        for attempt in 0..self.config.election_max_attempts {
            if self.runtime.is_shutdown() {
                return Ok(false);
            }
            match self.settled().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    tracing::debug!(job = %self.runtime.job_name(), attempt, error = %e, "Election check failed, retrying");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(election_backoff(base_ms, attempt)).await;
            if let Err(e) = self.elect_if_needed().await {
                tracing::debug!(job = %self.runtime.job_name(), attempt, error = %e, "Election attempt failed");
            }
        }
        self.is_leader().await
    }

    /// A leader is present, or nobody could become one.
    async fn settled(&self) -> Result<bool> {
        if self.has_leader().await? {
            return Ok(true);
        }
        Ok(!self.servers.has_available_servers().await?)
    }

    /// Poll until some instance holds the token or `timeout` elapses.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader_id().await? {
                return Ok(Some(leader));
            }
            if tokio::time::Instant::now() >= deadline || self.runtime.is_shutdown() {
                return Ok(None);
            }
            tokio::time::sleep(self.config.leader_poll_interval()).await;
        }
    }

    /// Give up leadership if this instance holds it.
    pub async fn remove_leader(&self) -> Result<bool> {
        let leader = self
            .storage
            .get_job_node_data(LEADER_ELECTION_INSTANCE)
            .await?;
        if leader.as_deref() != Some(self.runtime.instance_id()) {
            return Ok(false);
        }
        let removed = self
            .storage
            .remove_job_node_if_existed(LEADER_ELECTION_INSTANCE)
            .await?;
        if removed {
            tracing::info!(
                job = %self.runtime.job_name(),
                instance_id = %self.runtime.instance_id(),
                "Released leadership"
            );
        }
        Ok(removed)
    }
}
