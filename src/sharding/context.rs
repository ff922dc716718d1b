use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config_service::ConfigService;
use crate::error::Result;
use crate::instance::DELIMITER;
use crate::runtime::JobRuntime;
use crate::storage::{JobNodePath, JobNodeStorage};

/// What one instance should execute in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingContexts {
    pub task_id: String,
    pub job_name: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    /// Items to run, each with its parameter (empty when none configured).
    pub sharding_item_parameters: BTreeMap<u32, String>,
}

impl ShardingContexts {
    pub fn items(&self) -> Vec<u32> {
        self.sharding_item_parameters.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sharding_item_parameters.is_empty()
    }

    /// Context handed to job code for a single item.
    pub fn sharding_context(&self, item: u32) -> ShardingContext {
        ShardingContext {
            job_name: self.job_name.clone(),
            task_id: self.task_id.clone(),
            sharding_total_count: self.sharding_total_count,
            job_parameter: self.job_parameter.clone(),
            sharding_item: item,
            sharding_parameter: self
                .sharding_item_parameters
                .get(&item)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingContext {
    pub job_name: String,
    pub task_id: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    pub sharding_item: u32,
    pub sharding_parameter: String,
}

/// Builds [`ShardingContexts`] for a set of items.
#[derive(Debug, Clone)]
pub struct ExecutionContextService {
    storage: JobNodeStorage,
    runtime: Arc<JobRuntime>,
    configs: Arc<ConfigService>,
}

impl ExecutionContextService {
    pub fn new(storage: JobNodeStorage, runtime: Arc<JobRuntime>, configs: Arc<ConfigService>) -> Self {
        Self {
            storage,
            runtime,
            configs,
        }
    }

    /// Context for `items`. With monitor-execution on, items that are still
    /// running somewhere are left out.
    pub async fn get_job_sharding_context(&self, items: &[u32]) -> Result<ShardingContexts> {
        let config = self.configs.load(true).await?;
        let mut items = items.to_vec();
        if config.monitor_execution {
            let mut idle = Vec::with_capacity(items.len());
            for item in items {
                if !self
                    .storage
                    .is_job_node_existed(&JobNodePath::running_node(item))
                    .await?
                {
                    idle.push(item);
                }
            }
            items = idle;
        }

        let parameters = config.item_parameters()?;
        let sharding_item_parameters: BTreeMap<u32, String> = items
            .iter()
            .map(|item| (*item, parameters.get(item).cloned().unwrap_or_default()))
            .collect();

        Ok(ShardingContexts {
            task_id: self.task_id(&items),
            job_name: config.job_name,
            sharding_total_count: config.sharding_total_count,
            job_parameter: config.job_parameter,
            sharding_item_parameters,
        })
    }

    fn task_id(&self, items: &[u32]) -> String {
        let items = items
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{job}{d}{items}{d}{instance}{d}{run}",
            job = self.runtime.job_name(),
            items = items,
            instance = self.runtime.instance_id(),
            run = Uuid::new_v4().simple(),
            d = DELIMITER,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::instance::JobInstance;
    use crate::registry::MemoryRegistry;

    async fn service(config: JobConfig) -> ExecutionContextService {
        let registry = MemoryRegistry::new();
        let storage = JobNodeStorage::new(registry.session(), "job");
        let configs = Arc::new(ConfigService::new(storage.clone()));
        configs.persist(&config).await.unwrap();
        let runtime = Arc::new(JobRuntime::new(
            "job",
            JobInstance::with_id("10.0.0.1@-@1", "10.0.0.1"),
        ));
        ExecutionContextService::new(storage, runtime, configs)
    }

    #[tokio::test]
    async fn context_carries_item_parameters() {
        let service = service(
            JobConfig::new("job", 3)
                .with_item_parameters("0=A,2=C")
                .with_job_parameter("p"),
        )
        .await;
        let contexts = service.get_job_sharding_context(&[0, 1, 2]).await.unwrap();
        assert_eq!(contexts.sharding_total_count, 3);
        assert_eq!(contexts.job_parameter, "p");
        assert_eq!(contexts.sharding_item_parameters[&0], "A");
        assert_eq!(contexts.sharding_item_parameters[&1], "");
        assert_eq!(contexts.sharding_context(2).sharding_parameter, "C");
        assert!(contexts.task_id.starts_with("job@-@0,1,2@-@10.0.0.1@-@1@-@"));
    }

    #[tokio::test]
    async fn running_items_are_skipped_when_monitored() {
        let service = service(JobConfig::new("job", 3)).await;
        service
            .storage
            .replace_job_node(&JobNodePath::running_node(1), "other")
            .await
            .unwrap();
        let contexts = service.get_job_sharding_context(&[0, 1, 2]).await.unwrap();
        assert_eq!(contexts.items(), vec![0, 2]);
    }

    #[tokio::test]
    async fn running_items_kept_without_monitoring() {
        let service = service(JobConfig::new("job", 3).with_monitor_execution(false)).await;
        service
            .storage
            .replace_job_node(&JobNodePath::running_node(1), "other")
            .await
            .unwrap();
        let contexts = service.get_job_sharding_context(&[0, 1, 2]).await.unwrap();
        assert_eq!(contexts.items(), vec![0, 1, 2]);
    }
}
