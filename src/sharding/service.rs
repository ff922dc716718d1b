use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::CoordinatorConfig;
use crate::config_service::ConfigService;
use crate::election::LeaderService;
use crate::error::Result;
use crate::instance::{InstanceService, JobInstance};
use crate::registry::TxnOp;
use crate::runtime::JobRuntime;
use crate::sharding::strategy::strategy_for;
use crate::storage::path::{SHARDING_NECESSARY, SHARDING_NODE, SHARDING_PROCESSING};
use crate::storage::{JobNodePath, JobNodeStorage};

/// Result of one [`ShardingService::sharding_if_necessary`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingOutcome {
    /// The assignment is stable.
    NotNeeded,
    /// This instance recomputed and persisted the assignment.
    Sharded,
    /// Resharding is pending but no instance can take items. The flag stays set.
    NoAvailableInstances,
    /// Resharding is pending and left to the leader.
    NotLeader,
}

/// Computes, persists and reads the sharding assignment.
///
/// The `leader/sharding/necessary` flag moves a job from stable to needing
/// resharding; only the leader clears it, inside the `leader/sharding/processing`
/// latch, in the same transaction that writes the new assignment. A leader
/// that dies mid-way leaves the flag set and the next leader starts over.
#[derive(Debug, Clone)]
pub struct ShardingService {
    storage: JobNodeStorage,
    runtime: Arc<JobRuntime>,
    leader: Arc<LeaderService>,
    instances: Arc<InstanceService>,
    configs: Arc<ConfigService>,
    config: CoordinatorConfig,
}

impl ShardingService {
    pub fn new(
        storage: JobNodeStorage,
        runtime: Arc<JobRuntime>,
        leader: Arc<LeaderService>,
        instances: Arc<InstanceService>,
        configs: Arc<ConfigService>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            storage,
            runtime,
            leader,
            instances,
            configs,
            config,
        }
    }

    pub fn job_name(&self) -> &str {
        self.storage.job_name()
    }

    /// Request resharding. Any instance may call this.
    pub async fn set_resharding_flag(&self) -> Result<()> {
        if self.storage.create_job_node_if_needed(SHARDING_NECESSARY).await? {
            tracing::info!(job = %self.storage.job_name(), "Resharding requested");
        }
        Ok(())
    }

    pub async fn is_need_sharding(&self) -> Result<bool> {
        self.storage.is_job_node_existed(SHARDING_NECESSARY).await
    }

    /// Whether a leader is rewriting the assignment right now.
    pub async fn is_sharding_in_progress(&self) -> Result<bool> {
        self.storage.is_job_node_existed(SHARDING_PROCESSING).await
    }

    /// Reshard if flagged and this instance leads. Followers return at once.
    pub async fn sharding_if_necessary(&self) -> Result<ShardingOutcome> {
        if !self.is_need_sharding().await? {
            return Ok(ShardingOutcome::NotNeeded);
        }
        let job_config = self.configs.load(false).await?;
        let available = self
            .instances
            .get_available_job_instances(job_config.label.as_deref())
            .await?;
        if available.is_empty() {
            tracing::debug!(job = %self.storage.job_name(), "No available instances, resharding deferred");
            return Ok(ShardingOutcome::NoAvailableInstances);
        }
        if !self.leader.is_leader_until_block().await? {
            return Ok(ShardingOutcome::NotLeader);
        }

        if job_config.monitor_execution {
            self.wait_for_running_items_completed().await?;
        }

        let owner = self.runtime.instance_id().to_string();
        self.storage
            .execute_in_latch(
                SHARDING_PROCESSING,
                &owner,
                self.config.latch_timeout(),
                self.config.leader_poll_interval(),
                || self.reshard(),
            )
            .await
    }

    /// Membership and config are read again here: both may have changed while
    /// waiting for running items, and the flag cannot be raised twice.
    async fn reshard(&self) -> Result<ShardingOutcome> {
        // A previous holder of the latch may already have finished.
        if !self.is_need_sharding().await? {
            return Ok(ShardingOutcome::NotNeeded);
        }
        let job_config = self.configs.load(false).await?;
        let available = self
            .instances
            .get_available_job_instances(job_config.label.as_deref())
            .await?;
        if available.is_empty() {
            tracing::debug!(job = %self.storage.job_name(), "Instances left while waiting, resharding deferred");
            return Ok(ShardingOutcome::NoAvailableInstances);
        }
        let total = job_config.sharding_total_count;
        let strategy = strategy_for(job_config.job_sharding_strategy_type);
        let assignment = strategy.sharding(&available, self.storage.job_name(), total);

        self.reset_sharding_info(total).await?;

        let mut ops: Vec<TxnOp> = assignment
            .iter()
            .flat_map(|(instance, items)| {
                items.iter().map(move |item| {
                    TxnOp::Create(
                        JobNodePath::sharding_instance_node(*item),
                        instance.instance_id.clone(),
                    )
                })
            })
            .collect();
        ops.push(TxnOp::Delete(SHARDING_NECESSARY.to_string()));
        self.storage.execute_in_transaction(ops).await?;

        for (instance, items) in &assignment {
            tracing::info!(
                job = %self.storage.job_name(),
                instance_id = %instance.instance_id,
                items = ?items,
                "Sharding assigned"
            );
        }
        Ok(ShardingOutcome::Sharded)
    }

    /// Drop old owners of items below `total` and every node of items above.
    async fn reset_sharding_info(&self, total: u32) -> Result<()> {
        for item in self.existing_items().await? {
            if item < total {
                self.storage
                    .remove_job_node_if_existed(&JobNodePath::sharding_instance_node(item))
                    .await?;
            } else {
                self.storage
                    .remove_job_node_if_existed(&JobNodePath::sharding_item_root(item))
                    .await?;
            }
        }
        Ok(())
    }

    /// Wait, bounded, for items running on live instances to finish so a new
    /// owner does not start them twice. Markers of dead instances are ignored.
    async fn wait_for_running_items_completed(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.running_wait_timeout();
        loop {
            let live: HashSet<String> = self
                .instances
                .get_live_instance_ids()
                .await?
                .into_iter()
                .collect();
            let mut busy = false;
            for item in self.existing_items().await? {
                if let Some(owner) = self
                    .storage
                    .get_job_node_data(&JobNodePath::running_node(item))
                    .await?
                {
                    if live.contains(&owner) {
                        busy = true;
                        break;
                    }
                }
            }
            if !busy {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    job = %self.storage.job_name(),
                    "Items still running after wait timeout, resharding anyway"
                );
                return Ok(());
            }
            tokio::time::sleep(self.config.leader_poll_interval()).await;
        }
    }

    /// Numeric children of `sharding`, ascending.
    pub async fn existing_items(&self) -> Result<Vec<u32>> {
        let mut items: Vec<u32> = self
            .storage
            .get_job_node_children_keys(SHARDING_NODE)
            .await?
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect();
        items.sort_unstable();
        Ok(items)
    }

    /// Persisted owner of every assigned item.
    pub async fn get_sharding_assignment(&self) -> Result<BTreeMap<u32, String>> {
        let mut result = BTreeMap::new();
        for item in self.existing_items().await? {
            if let Some(owner) = self
                .storage
                .get_job_node_data(&JobNodePath::sharding_instance_node(item))
                .await?
            {
                result.insert(item, owner);
            }
        }
        Ok(result)
    }

    /// Items persisted for `instance_id`. Empty if that instance's server is
    /// not available.
    pub async fn get_sharding_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let server_ip = JobInstance::from_id(instance_id).server_ip;
        let servers = self.instances.servers();
        if !servers.is_available_server(&server_ip).await? {
            return Ok(Vec::new());
        }
        let total = self.configs.load(true).await?.sharding_total_count;
        Ok(self
            .get_sharding_assignment()
            .await?
            .into_iter()
            .filter(|(item, owner)| *item < total && owner == instance_id)
            .map(|(item, _)| item)
            .collect())
    }

    pub async fn get_local_sharding_items(&self) -> Result<Vec<u32>> {
        if self.runtime.is_shutdown() || !self.instances.is_local_job_instance_existed().await? {
            return Ok(Vec::new());
        }
        self.get_sharding_items(self.runtime.instance_id()).await
    }

    /// Some item is assigned to an instance that is no longer live.
    pub async fn has_sharding_info_in_offline_servers(&self) -> Result<bool> {
        let live: HashSet<String> = self
            .instances
            .get_live_instance_ids()
            .await?
            .into_iter()
            .collect();
        Ok(self
            .get_sharding_assignment()
            .await?
            .values()
            .any(|owner| !live.contains(owner)))
    }

    /// Some item below the total count has no owner at all.
    pub async fn has_unassigned_items(&self) -> Result<bool> {
        let total = self.configs.load(true).await?.sharding_total_count;
        let assignment = self.get_sharding_assignment().await?;
        Ok((0..total).any(|item| !assignment.contains_key(&item)))
    }
}
