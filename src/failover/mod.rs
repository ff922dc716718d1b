//! Failover of sharding items abandoned by crashed instances.
//!
//! Abandoned items are queued as `leader/failover/items/{item}` nodes. Any live
//! instance may claim one: deleting the queue node is the claim, so when two
//! instances race for the same item exactly one delete succeeds and the loser
//! moves on to the next entry. The winner records itself in
//! `sharding/{item}/failover` until the item completes, which also tells the
//! item's regular owner to leave it alone.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config_service::ConfigService;
use crate::error::Result;
use crate::execution::ExecutionService;
use crate::instance::InstanceService;
use crate::runtime::JobRuntime;
use crate::sharding::ShardingService;
use crate::storage::path::{FAILOVER_ITEMS_ROOT, SHARDING_NODE};
use crate::storage::{JobNodePath, JobNodeStorage};

#[derive(Debug, Clone)]
pub struct FailoverService {
    storage: JobNodeStorage,
    runtime: Arc<JobRuntime>,
    configs: Arc<ConfigService>,
    execution: Arc<ExecutionService>,
    sharding: Arc<ShardingService>,
    instances: Arc<InstanceService>,
}

impl FailoverService {
    pub fn new(
        storage: JobNodeStorage,
        runtime: Arc<JobRuntime>,
        configs: Arc<ConfigService>,
        execution: Arc<ExecutionService>,
        sharding: Arc<ShardingService>,
        instances: Arc<InstanceService>,
    ) -> Self {
        Self {
            storage,
            runtime,
            configs,
            execution,
            sharding,
            instances,
        }
    }

    /// Queue `item` for failover. Re-queuing an already queued item is a no-op.
    pub async fn enqueue(&self, item: u32) -> Result<bool> {
        let created = self
            .storage
            .create_job_node_if_needed(&JobNodePath::failover_item_node(item))
            .await?;
        if created {
            tracing::info!(job = %self.storage.job_name(), item, "Item queued for failover");
        }
        Ok(created)
    }

    /// Queued items in registry listing order.
    pub async fn queued_items(&self) -> Result<Vec<u32>> {
        Ok(self
            .storage
            .get_job_node_children_keys(FAILOVER_ITEMS_ROOT)
            .await?
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect())
    }

    /// Claim the first queued item that is safe to run here.
    ///
    /// Nothing is claimed while this job is executing locally, and items still
    /// marked running by a live instance are skipped. Never blocks.
    pub async fn dequeue(&self) -> Result<Option<u32>> {
        if self.runtime.is_running() || self.runtime.is_shutdown() {
            return Ok(None);
        }
        let queued = self.queued_items().await?;
        if queued.is_empty() {
            return Ok(None);
        }
        let live = self.live_instance_ids().await?;
        for item in queued {
            if let Some(owner) = self.execution.running_owner(item).await? {
                if live.contains(&owner) {
                    continue;
                }
            }
            if self
                .storage
                .remove_job_node_if_existed(&JobNodePath::failover_item_node(item))
                .await?
            {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Claim one queued item for this instance if failover is enabled, and
    /// ask the execution loop to run it.
    pub async fn failover_if_necessary(&self) -> Result<Option<u32>> {
        if !self.configs.load(true).await?.failover {
            return Ok(None);
        }
        let Some(item) = self.dequeue().await? else {
            return Ok(None);
        };
        self.storage
            .replace_job_node(&JobNodePath::failover_node(item), self.runtime.instance_id())
            .await?;
        tracing::info!(
            job = %self.storage.job_name(),
            item,
            instance_id = %self.runtime.instance_id(),
            "Took over failover item"
        );
        self.runtime.request_trigger();
        Ok(Some(item))
    }

    pub async fn update_failover_complete(&self, items: &[u32]) -> Result<()> {
        for item in items {
            self.storage
                .remove_job_node_if_existed(&JobNodePath::failover_node(*item))
                .await?;
        }
        Ok(())
    }

    /// Items that `instance_id` took over through failover.
    pub async fn get_failover_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let mut result = Vec::new();
        for item in self.sharding.existing_items().await? {
            if self
                .storage
                .get_job_node_data(&JobNodePath::failover_node(item))
                .await?
                .as_deref()
                == Some(instance_id)
            {
                result.push(item);
            }
        }
        Ok(result)
    }

    pub async fn get_local_failover_items(&self) -> Result<Vec<u32>> {
        if self.runtime.is_shutdown() {
            return Ok(Vec::new());
        }
        self.get_failover_items(self.runtime.instance_id()).await
    }

    /// Local sharding items currently being run by someone else via failover.
    pub async fn get_local_taken_over_items(&self) -> Result<Vec<u32>> {
        let mut result = Vec::new();
        for item in self.sharding.get_local_sharding_items().await? {
            if self
                .storage
                .is_job_node_existed(&JobNodePath::failover_node(item))
                .await?
            {
                result.push(item);
            }
        }
        Ok(result)
    }

    /// Queue every item whose running marker belongs to an instance missing
    /// from `live`. Returns the items found orphaned.
    pub async fn enqueue_orphans(&self, live: &HashSet<String>) -> Result<Vec<u32>> {
        let mut orphaned = Vec::new();
        for (item, owner) in self.execution.get_running_items().await? {
            if !live.contains(&owner) {
                self.reclaim(item, &owner).await?;
                orphaned.push(item);
            }
        }
        self.clear_dead_takeovers(live).await?;
        Ok(orphaned)
    }

    /// Queue the items `instance_id` was running when it disappeared.
    pub async fn enqueue_crashed_instance(&self, instance_id: &str) -> Result<Vec<u32>> {
        let mut orphaned = Vec::new();
        for (item, owner) in self.execution.get_running_items().await? {
            if owner == instance_id {
                self.reclaim(item, &owner).await?;
                orphaned.push(item);
            }
        }
        let live = self.live_instance_ids().await?;
        self.clear_dead_takeovers(&live).await?;
        if !orphaned.is_empty() {
            tracing::warn!(
                job = %self.storage.job_name(),
                instance_id,
                items = ?orphaned,
                "Instance crashed with running items"
            );
        }
        Ok(orphaned)
    }

    /// Disable failover: drop the queue and every takeover record.
    pub async fn remove_failover_info(&self) -> Result<()> {
        self.storage
            .remove_job_node_if_existed(FAILOVER_ITEMS_ROOT)
            .await?;
        for item in self.sharding.existing_items().await? {
            self.storage
                .remove_job_node_if_existed(&JobNodePath::failover_node(item))
                .await?;
        }
        Ok(())
    }

    /// Queue `item` (when failover is on) and drop the dead owner's marker.
    async fn reclaim(&self, item: u32, owner: &str) -> Result<()> {
        if self.configs.load(true).await?.failover {
            self.enqueue(item).await?;
        }
        if self.execution.running_owner(item).await?.as_deref() == Some(owner) {
            self.storage
                .remove_job_node_if_existed(&JobNodePath::running_node(item))
                .await?;
        }
        Ok(())
    }

    /// Takeover records of dead instances would keep the regular owner away
    /// from an item forever.
    async fn clear_dead_takeovers(&self, live: &HashSet<String>) -> Result<()> {
        for key in self.storage.get_job_node_children_keys(SHARDING_NODE).await? {
            let Ok(item) = key.parse::<u32>() else {
                continue;
            };
            let node = JobNodePath::failover_node(item);
            if let Some(owner) = self.storage.get_job_node_data(&node).await? {
                if !live.contains(&owner) {
                    self.storage.remove_job_node_if_existed(&node).await?;
                }
            }
        }
        Ok(())
    }

    async fn live_instance_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .instances
            .get_live_instance_ids()
            .await?
            .into_iter()
            .collect())
    }
}
