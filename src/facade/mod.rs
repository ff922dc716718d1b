//! Everything an executor needs from the coordination engine for one run.

use std::sync::Arc;

use crate::config::JobConfig;
use crate::config_service::ConfigService;
use crate::error::Result;
use crate::execution::ExecutionService;
use crate::failover::FailoverService;
use crate::runtime::JobRuntime;
use crate::sharding::{ExecutionContextService, ShardingContexts, ShardingOutcome, ShardingService};

#[derive(Debug, Clone)]
pub struct JobFacade {
    runtime: Arc<JobRuntime>,
    configs: Arc<ConfigService>,
    sharding: Arc<ShardingService>,
    contexts: Arc<ExecutionContextService>,
    execution: Arc<ExecutionService>,
    failover: Arc<FailoverService>,
}

impl JobFacade {
    pub fn new(
        runtime: Arc<JobRuntime>,
        configs: Arc<ConfigService>,
        sharding: Arc<ShardingService>,
        contexts: Arc<ExecutionContextService>,
        execution: Arc<ExecutionService>,
        failover: Arc<FailoverService>,
    ) -> Self {
        Self {
            runtime,
            configs,
            sharding,
            contexts,
            execution,
            failover,
        }
    }

    pub async fn load_config(&self) -> Result<JobConfig> {
        self.configs.load(true).await
    }

    /// Fails with an execution-environment error when the local clock is too
    /// far from the registry's.
    pub async fn check_job_execution_environment(&self) -> Result<()> {
        self.configs.check_max_time_diff_seconds_tolerable().await
    }

    /// Items this instance should run now.
    ///
    /// Failover items taken over by this instance go first and alone. Otherwise
    /// the assignment is brought up to date (leader) or awaited (followers get
    /// nothing while resharding is pending), then items taken over by others
    /// and disabled items are dropped.
    pub async fn get_sharding_contexts(&self) -> Result<ShardingContexts> {
        let config = self.load_config().await?;
        if config.failover {
            let taken = self.failover.get_local_failover_items().await?;
            if !taken.is_empty() {
                return self.contexts.get_job_sharding_context(&taken).await;
            }
        }

        let outcome = self.sharding.sharding_if_necessary().await?;
        if outcome != ShardingOutcome::Sharded
            && (self.sharding.is_need_sharding().await?
                || self.sharding.is_sharding_in_progress().await?)
        {
            tracing::debug!(job = %config.job_name, ?outcome, "Assignment pending, nothing to run");
            return self.contexts.get_job_sharding_context(&[]).await;
        }

        let mut items = self.sharding.get_local_sharding_items().await?;
        if config.failover {
            let taken_over = self.failover.get_local_taken_over_items().await?;
            items.retain(|item| !taken_over.contains(item));
        }
        let disabled = self.execution.get_disabled_items(&items).await?;
        items.retain(|item| !disabled.contains(item));
        self.contexts.get_job_sharding_context(&items).await
    }

    /// Record a misfire and return true if any of `items` is still running.
    pub async fn misfire_if_necessary(&self, items: &[u32]) -> Result<bool> {
        self.execution.misfire_if_has_running_items(items).await
    }

    /// Record a misfire for all local items so the run in progress catches
    /// up once it finishes. No-op when misfire handling is off.
    pub async fn misfire_local_items(&self) -> Result<()> {
        if !self.load_config().await?.misfire {
            return Ok(());
        }
        let items = self.sharding.get_local_sharding_items().await?;
        self.execution.set_misfire(&items).await
    }

    pub async fn is_execute_misfired(&self, items: &[u32]) -> Result<bool> {
        self.execution.is_misfired(items).await
    }

    pub async fn clear_misfire(&self, items: &[u32]) -> Result<()> {
        self.execution.clear_misfire(items).await
    }

    pub async fn is_need_sharding(&self) -> Result<bool> {
        self.sharding.is_need_sharding().await
    }

    pub async fn register_job_begin(&self, contexts: &ShardingContexts) -> Result<()> {
        self.execution.register_begin(&contexts.items()).await
    }

    pub async fn register_job_completed(&self, contexts: &ShardingContexts) -> Result<()> {
        let items = contexts.items();
        self.execution.register_complete(&items).await?;
        if self.load_config().await?.failover {
            self.failover.update_failover_complete(&items).await?;
        }
        Ok(())
    }

    /// Claim one queued failover item for this instance, if any.
    pub async fn failover_if_necessary(&self) -> Result<Option<u32>> {
        self.failover.failover_if_necessary().await
    }

    /// Whether a long-running job should keep fetching work.
    pub async fn is_eligible_for_job_running(&self) -> Result<bool> {
        if self.runtime.is_shutdown() || self.runtime.is_suspended() {
            return Ok(false);
        }
        Ok(!self.is_need_sharding().await?)
    }

    /// Queue failed `items` for another attempt when failover is enabled.
    pub async fn post_job_execution_error(&self, items: &[u32]) -> Result<()> {
        if !self.load_config().await?.failover {
            return Ok(());
        }
        for item in items {
            self.failover.enqueue(*item).await?;
        }
        Ok(())
    }
}
