//! Running, misfire and disabled markers per sharding item.
//!
//! With monitor-execution on, `sharding/{item}/running` holds the id of the
//! instance executing the item. The marker is persistent: when its owner
//! crashes it stays behind, which is how reconciliation finds abandoned work.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config_service::ConfigService;
use crate::error::Result;
use crate::instance::DELIMITER;
use crate::runtime::JobRuntime;
use crate::storage::path::{INSTANCES_NODE, SHARDING_NODE};
use crate::storage::{JobNodePath, JobNodeStorage};

#[derive(Debug, Clone)]
pub struct ExecutionService {
    storage: JobNodeStorage,
    runtime: Arc<JobRuntime>,
    configs: Arc<ConfigService>,
}

impl ExecutionService {
    pub fn new(storage: JobNodeStorage, runtime: Arc<JobRuntime>, configs: Arc<ConfigService>) -> Self {
        Self {
            storage,
            runtime,
            configs,
        }
    }

    async fn monitor_execution(&self) -> Result<bool> {
        Ok(self.configs.load(true).await?.monitor_execution)
    }

    /// Mark `items` as running on this instance.
    pub async fn register_begin(&self, items: &[u32]) -> Result<()> {
        if !self.monitor_execution().await? {
            return Ok(());
        }
        for item in items {
            self.storage
                .replace_job_node(&JobNodePath::running_node(*item), self.runtime.instance_id())
                .await?;
        }
        Ok(())
    }

    /// Clear this instance's running markers for `items`.
    pub async fn register_complete(&self, items: &[u32]) -> Result<()> {
        if !self.monitor_execution().await? {
            return Ok(());
        }
        self.clear_running_info(items).await
    }

    pub async fn is_running(&self, item: u32) -> Result<bool> {
        self.storage
            .is_job_node_existed(&JobNodePath::running_node(item))
            .await
    }

    pub async fn running_owner(&self, item: u32) -> Result<Option<String>> {
        self.storage
            .get_job_node_data(&JobNodePath::running_node(item))
            .await
    }

    /// Whether any of `items` is running anywhere. Always false without
    /// monitor-execution, since no markers are written then.
    pub async fn has_running_items(&self, items: &[u32]) -> Result<bool> {
        if !self.monitor_execution().await? {
            return Ok(false);
        }
        for item in items {
            if self.is_running(*item).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every running marker, item to owning instance id.
    pub async fn get_running_items(&self) -> Result<BTreeMap<u32, String>> {
        let mut result = BTreeMap::new();
        for key in self.storage.get_job_node_children_keys(SHARDING_NODE).await? {
            let Ok(item) = key.parse::<u32>() else {
                continue;
            };
            if let Some(owner) = self.running_owner(item).await? {
                result.insert(item, owner);
            }
        }
        Ok(result)
    }

    /// Remove this instance's markers on `items`. Markers owned by others stay.
    pub async fn clear_running_info(&self, items: &[u32]) -> Result<()> {
        for item in items {
            if self.running_owner(*item).await?.as_deref() == Some(self.runtime.instance_id()) {
                self.storage
                    .remove_job_node_if_existed(&JobNodePath::running_node(*item))
                    .await?;
            }
        }
        Ok(())
    }

    /// Self-cleanup on startup, reconnect and shutdown: drop markers owned by
    /// this instance and by dead instances of the same server, i.e. earlier
    /// incarnations of this process. Other hosts' orphans are left to
    /// failover.
    pub async fn clear_all_running_info(&self) -> Result<usize> {
        let live: HashSet<String> = self
            .storage
            .get_job_node_children_keys(INSTANCES_NODE)
            .await?
            .into_iter()
            .collect();
        let own_server = format!("{}{}", self.runtime.instance().server_ip, DELIMITER);
        let mut cleared = 0;
        for (item, owner) in self.get_running_items().await? {
            let is_self = owner == self.runtime.instance_id();
            let is_stale_local = owner.starts_with(&own_server) && !live.contains(&owner);
            if is_self || is_stale_local {
                self.storage
                    .remove_job_node_if_existed(&JobNodePath::running_node(item))
                    .await?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            tracing::info!(job = %self.storage.job_name(), cleared, "Cleared stale running markers");
        }
        Ok(cleared)
    }

    /// Whether the run should be skipped because some of `items` is still
    /// running. A misfire is recorded for them only when misfire is enabled.
    pub async fn misfire_if_has_running_items(&self, items: &[u32]) -> Result<bool> {
        if !self.has_running_items(items).await? {
            return Ok(false);
        }
        if self.configs.load(true).await?.misfire {
            self.set_misfire(items).await?;
        }
        Ok(true)
    }

    pub async fn set_misfire(&self, items: &[u32]) -> Result<()> {
        for item in items {
            self.storage
                .create_job_node_if_needed(&JobNodePath::misfire_node(*item))
                .await?;
        }
        Ok(())
    }

    pub async fn get_misfired_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        let mut result = Vec::new();
        for item in items {
            if self
                .storage
                .is_job_node_existed(&JobNodePath::misfire_node(*item))
                .await?
            {
                result.push(*item);
            }
        }
        Ok(result)
    }

    pub async fn is_misfired(&self, items: &[u32]) -> Result<bool> {
        Ok(!self.get_misfired_items(items).await?.is_empty())
    }

    pub async fn clear_misfire(&self, items: &[u32]) -> Result<()> {
        for item in items {
            self.storage
                .remove_job_node_if_existed(&JobNodePath::misfire_node(*item))
                .await?;
        }
        Ok(())
    }

    pub async fn get_disabled_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        let mut result = Vec::new();
        for item in items {
            if self
                .storage
                .is_job_node_existed(&JobNodePath::disabled_node(*item))
                .await?
            {
                result.push(*item);
            }
        }
        Ok(result)
    }

    pub async fn disable_item(&self, item: u32) -> Result<()> {
        self.storage
            .create_job_node_if_needed(&JobNodePath::disabled_node(item))
            .await?;
        Ok(())
    }

    pub async fn enable_item(&self, item: u32) -> Result<()> {
        self.storage
            .remove_job_node_if_existed(&JobNodePath::disabled_node(item))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::instance::JobInstance;
    use crate::registry::MemoryRegistry;

    async fn service(registry: &MemoryRegistry, id: &str, config: JobConfig) -> ExecutionService {
        let storage = JobNodeStorage::new(registry.session(), "job");
        let configs = Arc::new(ConfigService::new(storage.clone()));
        configs.persist(&config).await.unwrap();
        let runtime = Arc::new(JobRuntime::new("job", JobInstance::from_id(id)));
        ExecutionService::new(storage, runtime, configs)
    }

    #[tokio::test]
    async fn begin_and_complete_toggle_markers() {
        let registry = MemoryRegistry::new();
        let a = service(&registry, "10.0.0.1@-@1", JobConfig::new("job", 3)).await;

        a.register_begin(&[0, 2]).await.unwrap();
        assert!(a.is_running(0).await.unwrap());
        assert!(!a.is_running(1).await.unwrap());
        assert!(a.has_running_items(&[1, 2]).await.unwrap());
        assert_eq!(a.running_owner(2).await.unwrap().as_deref(), Some("10.0.0.1@-@1"));

        a.register_complete(&[0, 2]).await.unwrap();
        assert!(!a.has_running_items(&[0, 1, 2]).await.unwrap());
    }

    #[tokio::test]
    async fn no_markers_without_monitor_execution() {
        let registry = MemoryRegistry::new();
        let a = service(
            &registry,
            "10.0.0.1@-@1",
            JobConfig::new("job", 3).with_monitor_execution(false),
        )
        .await;
        a.register_begin(&[0]).await.unwrap();
        assert!(!a.is_running(0).await.unwrap());
        assert!(!a.misfire_if_has_running_items(&[0]).await.unwrap());
    }

    #[tokio::test]
    async fn complete_leaves_other_owners_markers() {
        let registry = MemoryRegistry::new();
        let a = service(&registry, "10.0.0.1@-@1", JobConfig::new("job", 3)).await;
        let b = service(&registry, "10.0.0.2@-@1", JobConfig::new("job", 3)).await;
        b.register_begin(&[1]).await.unwrap();
        a.register_complete(&[1]).await.unwrap();
        assert!(a.is_running(1).await.unwrap());
    }

    #[tokio::test]
    async fn misfire_recorded_while_running() {
        let registry = MemoryRegistry::new();
        let a = service(&registry, "10.0.0.1@-@1", JobConfig::new("job", 3)).await;
        a.register_begin(&[1]).await.unwrap();

        assert!(a.misfire_if_has_running_items(&[0, 1]).await.unwrap());
        assert_eq!(a.get_misfired_items(&[0, 1, 2]).await.unwrap(), vec![0, 1]);
        assert!(a.is_misfired(&[1]).await.unwrap());

        a.clear_misfire(&[0, 1]).await.unwrap();
        assert!(!a.is_misfired(&[0, 1]).await.unwrap());
    }

    #[tokio::test]
    async fn no_misfire_recorded_when_disabled() {
        let registry = MemoryRegistry::new();
        let a = service(
            &registry,
            "10.0.0.1@-@1",
            JobConfig::new("job", 3).with_misfire(false),
        )
        .await;
        a.register_begin(&[1]).await.unwrap();

        assert!(a.misfire_if_has_running_items(&[0, 1]).await.unwrap(), "Run is still skipped");
        assert!(a.get_misfired_items(&[0, 1, 2]).await.unwrap().is_empty());
        assert!(!a.storage.is_job_node_existed(&JobNodePath::misfire_node(1)).await.unwrap());
    }

    #[tokio::test]
    async fn clear_all_running_info_only_touches_own_server() {
        let registry = MemoryRegistry::new();
        let a = service(&registry, "10.0.0.1@-@2", JobConfig::new("job", 3)).await;
        let storage = JobNodeStorage::new(registry.session(), "job");
        // Previous incarnation on the same host, and a live-or-dead peer host.
        storage
            .replace_job_node(&JobNodePath::running_node(0), "10.0.0.1@-@1")
            .await
            .unwrap();
        storage
            .replace_job_node(&JobNodePath::running_node(1), "10.0.0.9@-@1")
            .await
            .unwrap();
        a.register_begin(&[2]).await.unwrap();

        assert_eq!(a.clear_all_running_info().await.unwrap(), 2);
        let running = a.get_running_items().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[&1], "10.0.0.9@-@1");
    }

    #[tokio::test]
    async fn disabled_items_round_trip() {
        let registry = MemoryRegistry::new();
        let a = service(&registry, "10.0.0.1@-@1", JobConfig::new("job", 3)).await;
        a.disable_item(1).await.unwrap();
        assert_eq!(a.get_disabled_items(&[0, 1, 2]).await.unwrap(), vec![1]);
        a.enable_item(1).await.unwrap();
        assert!(a.get_disabled_items(&[0, 1, 2]).await.unwrap().is_empty());
    }
}
