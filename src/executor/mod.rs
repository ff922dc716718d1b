//! Drives one run of a job on this instance.
//!
//! A run asks the [`JobFacade`] which items to execute, marks them running,
//! executes them concurrently, reports failures, and marks them complete.
//! Misfired items get one catch-up run; afterwards the instance tries to take
//! over one queued failover item, which triggers another run.

pub mod error_handler;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::error::{CoordError, JobError, Result};
use crate::facade::JobFacade;
use crate::runtime::JobRuntime;
use crate::sharding::{ShardingContext, ShardingContexts};

pub use error_handler::{ErrorHandlerRegistry, JobErrorHandler};

/// User job code for a single sharding item.
#[async_trait]
pub trait ShardingJob: Send + Sync + 'static {
    async fn execute(&self, context: ShardingContext) -> std::result::Result<(), JobError>;
}

/// What a call to [`JobExecutor::execute`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub task_id: Option<String>,
    /// Items executed, catch-up runs included, in completion order.
    pub executed: Vec<u32>,
    pub failed: Vec<u32>,
    /// Skipped because some of the items were still running.
    pub misfired: bool,
    /// Failover item claimed after the run.
    pub failover_claimed: Option<u32>,
}

/// Clears the local running flag when a run ends, however it ends.
struct RunningGuard<'a>(&'a JobRuntime);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.end_running();
    }
}

pub struct JobExecutor {
    job: Arc<dyn ShardingJob>,
    facade: Arc<JobFacade>,
    runtime: Arc<JobRuntime>,
    error_handlers: ErrorHandlerRegistry,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("job", &self.runtime.job_name())
            .field("instance_id", &self.runtime.instance_id())
            .finish()
    }
}

impl JobExecutor {
    pub fn new(job: Arc<dyn ShardingJob>, facade: Arc<JobFacade>, runtime: Arc<JobRuntime>) -> Self {
        Self::with_error_handlers(job, facade, runtime, ErrorHandlerRegistry::default())
    }

    pub fn with_error_handlers(
        job: Arc<dyn ShardingJob>,
        facade: Arc<JobFacade>,
        runtime: Arc<JobRuntime>,
        error_handlers: ErrorHandlerRegistry,
    ) -> Self {
        Self {
            job,
            facade,
            runtime,
            error_handlers,
        }
    }

    pub fn facade(&self) -> &Arc<JobFacade> {
        &self.facade
    }

    /// Run the job once for this instance's current items.
    ///
    /// Errors raised by job code go to the configured error handler and, with
    /// failover on, requeue the failed items; they only fail the call when the
    /// handler escalates them. Coordination failures are returned as-is.
    pub async fn execute(&self) -> Result<ExecutionSummary> {
        let mut summary = ExecutionSummary::default();
        {
            if !self.runtime.begin_running() {
                tracing::debug!(job = %self.runtime.job_name(), "Previous run still in progress");
                self.facade.misfire_local_items().await?;
                summary.misfired = true;
                return Ok(summary);
            }
            let _running = RunningGuard(&self.runtime);
            self.execute_guarded(&mut summary).await?;
        }

        if !self.runtime.is_shutdown() {
            summary.failover_claimed = self.facade.failover_if_necessary().await?;
        }
        Ok(summary)
    }

    async fn execute_guarded(&self, summary: &mut ExecutionSummary) -> Result<()> {
        let config = self.facade.load_config().await?;
        let handler = self.error_handlers.get(&config.job_error_handler_type);

        if let Err(e) = self.facade.check_job_execution_environment().await {
            if !matches!(e, CoordError::ExecutionEnvironment { .. }) {
                return Err(e);
            }
            let job_error = JobError::new(e.to_string());
            if handler.handle_exception(&config.job_name, &job_error).is_err() {
                return Err(e);
            }
        }

        let contexts = self.facade.get_sharding_contexts().await?;
        if contexts.is_empty() {
            return Ok(());
        }
        summary.task_id = Some(contexts.task_id.clone());
        let items = contexts.items();
        if self.facade.misfire_if_necessary(&items).await? {
            tracing::info!(job = %config.job_name, items = ?items, "Items still running, misfire recorded");
            summary.misfired = true;
            return Ok(());
        }

        let mut escalated = self.run_items(&contexts, handler.as_ref(), summary).await?;

        if config.misfire && escalated.is_none() && self.facade.is_execute_misfired(&items).await? {
            self.facade.clear_misfire(&items).await?;
            tracing::info!(job = %config.job_name, items = ?items, "Running misfired items");
            escalated = self.run_items(&contexts, handler.as_ref(), summary).await?;
        }

        match escalated {
            Some(source) => Err(CoordError::JobFailed {
                job_name: config.job_name,
                source,
            }),
            None => Ok(()),
        }
    }

    /// One pass over `contexts`. Returns the first error the handler
    /// escalated, if any.
    async fn run_items(
        &self,
        contexts: &ShardingContexts,
        handler: &dyn JobErrorHandler,
        summary: &mut ExecutionSummary,
    ) -> Result<Option<JobError>> {
        self.facade.register_job_begin(contexts).await?;

        let mut set = JoinSet::new();
        for item in contexts.items() {
            let job = self.job.clone();
            let context = contexts.sharding_context(item);
            set.spawn(async move { (item, job.execute(context).await) });
        }

        let mut reported = Vec::new();
        let mut failed = Vec::new();
        let mut escalated = None;
        while let Some(joined) = set.join_next().await {
            let (item, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(job = %contexts.job_name, error = %e, "Job task panicked");
                    continue;
                }
            };
            reported.push(item);
            if let Err(error) = result {
                failed.push(item);
                if let Err(error) = handler.handle_exception(&contexts.job_name, &error) {
                    escalated.get_or_insert(error);
                }
            }
        }
        // A panicked task never reports its item.
        for item in contexts.items() {
            if !reported.contains(&item) {
                failed.push(item);
            }
        }
        summary.executed.extend(reported);

        if !failed.is_empty() {
            failed.sort_unstable();
            self.facade.post_job_execution_error(&failed).await?;
            summary.failed.extend(failed.iter().copied());
        }
        self.facade.register_job_completed(contexts).await?;
        Ok(escalated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_guard_clears_flag() {
        let runtime = JobRuntime::new("job", crate::instance::JobInstance::from_id("10.0.0.1@-@1"));
        assert!(runtime.begin_running());
        drop(RunningGuard(&runtime));
        assert!(!runtime.is_running());
    }
}
