use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CoordinatorConfig;
use crate::config_service::ConfigService;
use crate::election::timer::election_backoff;
use crate::election::LeaderService;
use crate::error::Result;
use crate::execution::ExecutionService;
use crate::failover::FailoverService;
use crate::instance::{InstanceService, ServerStatus};
use crate::listener::{ChangeHandler, JobChange, StateHandler};
use crate::registry::{ChangeType, ConnectionState};
use crate::runtime::JobRuntime;
use crate::sharding::ShardingService;
use crate::storage::path::{FAILOVER_ITEMS_ROOT, LEADER_ELECTION_INSTANCE};
use crate::storage::{JobNodePath, JobNodeStorage};

/// Config edits that move items around request resharding; turning failover
/// off drops queued work.
#[derive(Debug)]
pub struct ConfigChangedHandler {
    configs: Arc<ConfigService>,
    sharding: Arc<ShardingService>,
    failover: Arc<FailoverService>,
}

impl ConfigChangedHandler {
    pub fn new(
        configs: Arc<ConfigService>,
        sharding: Arc<ShardingService>,
        failover: Arc<FailoverService>,
    ) -> Self {
        Self {
            configs,
            sharding,
            failover,
        }
    }
}

#[async_trait]
impl ChangeHandler for ConfigChangedHandler {
    fn name(&self) -> &'static str {
        "config_changed"
    }

    async fn on_change(&self, change: JobChange<'_>) -> Result<()> {
        if !JobNodePath::is_config_path(change.path)
            || change.event.change_type == ChangeType::Deleted
        {
            return Ok(());
        }
        let (previous, current) = self.configs.reload().await?;
        let Some(previous) = previous else {
            return Ok(());
        };
        if current.requires_resharding_from(&previous) {
            tracing::info!(
                job = %current.job_name,
                total = current.sharding_total_count,
                strategy = %current.job_sharding_strategy_type,
                "Configuration changed"
            );
            self.sharding.set_resharding_flag().await?;
        }
        if previous.failover && !current.failover {
            self.failover.remove_failover_info().await?;
        }
        Ok(())
    }
}

/// Servers or instances joining, leaving or changing status invalidate the
/// assignment.
#[derive(Debug)]
pub struct MembershipChangedHandler {
    sharding: Arc<ShardingService>,
}

impl MembershipChangedHandler {
    pub fn new(sharding: Arc<ShardingService>) -> Self {
        Self { sharding }
    }
}

#[async_trait]
impl ChangeHandler for MembershipChangedHandler {
    fn name(&self) -> &'static str {
        "membership_changed"
    }

    async fn on_change(&self, change: JobChange<'_>) -> Result<()> {
        let relevant = if JobNodePath::is_instance_path(change.path) {
            change.event.change_type != ChangeType::Updated
        } else {
            JobNodePath::is_server_path(change.path)
        };
        if relevant {
            self.sharding.set_resharding_flag().await?;
        }
        Ok(())
    }
}

/// Re-contend when the token vanishes or the local server comes back, and
/// step down when the local server is disabled.
#[derive(Debug)]
pub struct LeaderElectionHandler {
    leader: Arc<LeaderService>,
    instances: Arc<InstanceService>,
    runtime: Arc<JobRuntime>,
}

impl LeaderElectionHandler {
    pub fn new(
        leader: Arc<LeaderService>,
        instances: Arc<InstanceService>,
        runtime: Arc<JobRuntime>,
    ) -> Self {
        Self {
            leader,
            instances,
            runtime,
        }
    }
}

#[async_trait]
impl ChangeHandler for LeaderElectionHandler {
    fn name(&self) -> &'static str {
        "leader_election"
    }

    async fn on_change(&self, change: JobChange<'_>) -> Result<()> {
        if self.runtime.is_shutdown() {
            return Ok(());
        }
        let change_type = change.event.change_type;

        if change.path == LEADER_ELECTION_INSTANCE && change_type == ChangeType::Deleted {
            tracing::info!(job = %self.runtime.job_name(), "Leader gone, electing");
            self.leader.elect_if_needed().await?;
            return Ok(());
        }

        let servers = self.instances.servers();
        if change.path == JobNodePath::server_node(servers.local_ip()) {
            match servers.status(servers.local_ip()).await? {
                Some(ServerStatus::Enabled) => {
                    if !self.leader.has_leader().await? {
                        self.leader.elect_if_needed().await?;
                    }
                }
                _ => {
                    self.leader.remove_leader().await?;
                }
            }
            return Ok(());
        }

        if JobNodePath::is_instance_path(change.path)
            && change_type == ChangeType::Created
            && !self.leader.has_leader().await?
        {
            self.leader.elect_if_needed().await?;
        }
        Ok(())
    }
}

/// Reclaims the running items of instances that disappear and picks up
/// queued failover work.
#[derive(Debug)]
pub struct FailoverHandler {
    failover: Arc<FailoverService>,
    runtime: Arc<JobRuntime>,
}

impl FailoverHandler {
    pub fn new(failover: Arc<FailoverService>, runtime: Arc<JobRuntime>) -> Self {
        Self { failover, runtime }
    }
}

#[async_trait]
impl ChangeHandler for FailoverHandler {
    fn name(&self) -> &'static str {
        "failover"
    }

    async fn on_change(&self, change: JobChange<'_>) -> Result<()> {
        if self.runtime.is_shutdown() {
            return Ok(());
        }
        let change_type = change.event.change_type;

        if JobNodePath::is_instance_path(change.path) && change_type == ChangeType::Deleted {
            let instance_id = JobNodePath::leaf(change.path);
            if instance_id == self.runtime.instance_id() {
                return Ok(());
            }
            self.failover.enqueue_crashed_instance(instance_id).await?;
            self.failover.failover_if_necessary().await?;
            return Ok(());
        }

        let queued = change
            .path
            .strip_prefix(FAILOVER_ITEMS_ROOT)
            .map_or(false, |rest| rest.starts_with('/'));
        if queued && change_type == ChangeType::Created {
            self.failover.failover_if_necessary().await?;
        }
        Ok(())
    }
}

/// `trigger/{id}`: run this instance once, now.
#[derive(Debug)]
pub struct TriggerHandler {
    storage: JobNodeStorage,
    runtime: Arc<JobRuntime>,
}

impl TriggerHandler {
    pub fn new(storage: JobNodeStorage, runtime: Arc<JobRuntime>) -> Self {
        Self { storage, runtime }
    }
}

#[async_trait]
impl ChangeHandler for TriggerHandler {
    fn name(&self) -> &'static str {
        "trigger"
    }

    async fn on_change(&self, change: JobChange<'_>) -> Result<()> {
        let node = JobNodePath::trigger_node(self.runtime.instance_id());
        if change.path != node || change.event.change_type != ChangeType::Created {
            return Ok(());
        }
        // Consumed once, whoever wins the delete.
        if self.storage.remove_job_node_if_existed(&node).await? && !self.runtime.is_shutdown() {
            tracing::info!(job = %self.runtime.job_name(), "Run triggered");
            self.runtime.request_trigger();
        }
        Ok(())
    }
}

/// `shutdown/{id}`: stop this instance gracefully.
#[derive(Debug)]
pub struct ShutdownHandler {
    storage: JobNodeStorage,
    runtime: Arc<JobRuntime>,
}

impl ShutdownHandler {
    pub fn new(storage: JobNodeStorage, runtime: Arc<JobRuntime>) -> Self {
        Self { storage, runtime }
    }
}

#[async_trait]
impl ChangeHandler for ShutdownHandler {
    fn name(&self) -> &'static str {
        "shutdown"
    }

    async fn on_change(&self, change: JobChange<'_>) -> Result<()> {
        let node = JobNodePath::shutdown_node(self.runtime.instance_id());
        if change.path != node || change.event.change_type != ChangeType::Created {
            return Ok(());
        }
        self.storage.remove_job_node_if_existed(&node).await?;
        if self.runtime.begin_shutdown() {
            tracing::info!(
                job = %self.runtime.job_name(),
                instance_id = %self.runtime.instance_id(),
                "Shutdown requested through registry"
            );
        }
        Ok(())
    }
}

/// Suspends execution while the session is unhealthy and rebuilds presence
/// after the session comes back, since its ephemeral nodes may be gone.
///
/// Rebuilding is retried with backoff until it succeeds or the job stops;
/// execution stays suspended meanwhile.
#[derive(Debug)]
pub struct ConnectionStateHandler {
    runtime: Arc<JobRuntime>,
    configs: Arc<ConfigService>,
    instances: Arc<InstanceService>,
    execution: Arc<ExecutionService>,
    sharding: Arc<ShardingService>,
    leader: Arc<LeaderService>,
    config: CoordinatorConfig,
}

impl ConnectionStateHandler {
    pub fn new(
        runtime: Arc<JobRuntime>,
        configs: Arc<ConfigService>,
        instances: Arc<InstanceService>,
        execution: Arc<ExecutionService>,
        sharding: Arc<ShardingService>,
        leader: Arc<LeaderService>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            runtime,
            configs,
            instances,
            execution,
            sharding,
            leader,
            config,
        }
    }

    async fn restore_presence(&self) -> Result<()> {
        let config = self.configs.load(true).await?;
        self.instances
            .servers()
            .persist_online(!config.disabled)
            .await?;
        self.instances.persist_online().await?;
        self.execution.clear_all_running_info().await?;
        self.sharding.set_resharding_flag().await?;
        self.leader.elect_if_needed().await?;
        Ok(())
    }
}

#[async_trait]
impl StateHandler for ConnectionStateHandler {
    async fn on_state(&self, state: ConnectionState) -> Result<()> {
        if self.runtime.is_shutdown() {
            return Ok(());
        }
        match state {
            ConnectionState::Connected => {}
            ConnectionState::Suspended | ConnectionState::Lost => {
                self.runtime.set_suspended(true);
            }
            ConnectionState::Reconnected => {
                self.runtime.set_suspended(true);
                let cancel = self.runtime.cancellation_token();
                let mut attempt = 0u32;
                while let Err(e) = self.restore_presence().await {
                    tracing::warn!(
                        job = %self.runtime.job_name(),
                        attempt,
                        error = %e,
                        "Failed to restore presence after reconnect, retrying"
                    );
                    let delay = election_backoff(self.config.election_retry_interval_ms, attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
                self.runtime.set_suspended(false);
                tracing::info!(
                    job = %self.runtime.job_name(),
                    instance_id = %self.runtime.instance_id(),
                    "Presence restored after reconnect"
                );
            }
        }
        Ok(())
    }
}
