use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{CoordinatorConfig, JobConfig};
use crate::config_service::ConfigService;
use crate::election::LeaderService;
use crate::error::{CoordError, Result};
use crate::execution::ExecutionService;
use crate::executor::{ExecutionSummary, JobExecutor, ShardingJob};
use crate::facade::JobFacade;
use crate::failover::FailoverService;
use crate::instance::{InstanceService, JobInstance, ServerService};
use crate::listener::{
    ConfigChangedHandler, ConnectionStateHandler, FailoverHandler, LeaderElectionHandler,
    ListenerManager, MembershipChangedHandler, ShutdownHandler, TriggerHandler,
};
use crate::reconcile::ReconcileService;
use crate::registry::RegistryCenter;
use crate::runtime::JobRuntime;
use crate::sharding::{ExecutionContextService, ShardingService};
use crate::storage::JobNodeStorage;

/// Hosts the jobs of one process.
///
/// Jobs are keyed by name and have an explicit lifecycle through
/// [`Node::start_job`] and [`Node::stop_job`]; nothing is process-global, so
/// several nodes can share one process (tests, the simulator).
#[derive(Debug)]
pub struct Node {
    instance: JobInstance,
    coordinator: CoordinatorConfig,
    jobs: RwLock<HashMap<String, Arc<JobNode>>>,
}

impl Node {
    /// Node for the current process on `server_ip`.
    pub fn new(server_ip: impl Into<String>) -> Self {
        Self::with_instance(JobInstance::new(server_ip))
    }

    pub fn with_instance(instance: JobInstance) -> Self {
        Self {
            instance,
            coordinator: CoordinatorConfig::default(),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_coordinator_config(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn instance(&self) -> &JobInstance {
        &self.instance
    }

    /// Register `job` with the registry and start coordinating it.
    ///
    /// Fails without joining the cluster if the job is already registered
    /// under a different job type.
    pub async fn start_job(
        &self,
        config: JobConfig,
        job: Arc<dyn ShardingJob>,
        registry: Arc<dyn RegistryCenter>,
    ) -> Result<Arc<JobNode>> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&config.job_name) {
            if !existing.is_stopped() {
                return Err(CoordError::InvalidConfig(format!(
                    "job '{}' is already started on this node",
                    config.job_name
                )));
            }
        }
        let node = JobNode::start(
            config,
            job,
            registry,
            self.instance.clone(),
            self.coordinator.clone(),
        )
        .await?;
        jobs.insert(node.job_name().to_string(), node.clone());
        Ok(node)
    }

    /// Stop a job gracefully. Returns false if it is not hosted here.
    pub async fn stop_job(&self, job_name: &str) -> bool {
        let node = self.jobs.write().await.remove(job_name);
        match node {
            Some(node) => {
                node.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn job(&self, job_name: &str) -> Option<Arc<JobNode>> {
        self.jobs.read().await.get(job_name).cloned()
    }

    pub async fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn shutdown_all(&self) {
        let nodes: Vec<Arc<JobNode>> = self.jobs.write().await.drain().map(|(_, n)| n).collect();
        for node in nodes {
            node.stop().await;
        }
    }
}

/// One job coordinated by this process.
#[derive(Debug)]
pub struct JobNode {
    runtime: Arc<JobRuntime>,
    storage: JobNodeStorage,
    configs: Arc<ConfigService>,
    instances: Arc<InstanceService>,
    leader: Arc<LeaderService>,
    sharding: Arc<ShardingService>,
    execution: Arc<ExecutionService>,
    failover: Arc<FailoverService>,
    reconcile: Arc<ReconcileService>,
    executor: Arc<JobExecutor>,
    coordinator: CoordinatorConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: OnceCell<()>,
}

impl JobNode {
    /// Start order: configuration, server presence, instance presence, own
    /// stale running markers, resharding request, election, background tasks.
    pub async fn start(
        config: JobConfig,
        job: Arc<dyn ShardingJob>,
        registry: Arc<dyn RegistryCenter>,
        instance: JobInstance,
        coordinator: CoordinatorConfig,
    ) -> Result<Arc<Self>> {
        let storage = JobNodeStorage::new(registry, config.job_name.clone());
        let configs = Arc::new(ConfigService::new(storage.clone()));
        let effective = configs.persist(&config).await?;

        let runtime = Arc::new(JobRuntime::new(effective.job_name.clone(), instance.clone()));
        let servers = Arc::new(ServerService::new(storage.clone(), instance.server_ip.clone()));
        let instances = Arc::new(InstanceService::new(storage.clone(), instance, servers.clone()));
        let leader = Arc::new(LeaderService::new(
            storage.clone(),
            servers.clone(),
            runtime.clone(),
            coordinator.clone(),
        ));
        let sharding = Arc::new(ShardingService::new(
            storage.clone(),
            runtime.clone(),
            leader.clone(),
            instances.clone(),
            configs.clone(),
            coordinator.clone(),
        ));
        let execution = Arc::new(ExecutionService::new(
            storage.clone(),
            runtime.clone(),
            configs.clone(),
        ));
        let failover = Arc::new(FailoverService::new(
            storage.clone(),
            runtime.clone(),
            configs.clone(),
            execution.clone(),
            sharding.clone(),
            instances.clone(),
        ));
        let reconcile = Arc::new(ReconcileService::new(
            leader.clone(),
            sharding.clone(),
            failover.clone(),
            instances.clone(),
            configs.clone(),
        ));
        let contexts = Arc::new(ExecutionContextService::new(
            storage.clone(),
            runtime.clone(),
            configs.clone(),
        ));
        let facade = Arc::new(JobFacade::new(
            runtime.clone(),
            configs.clone(),
            sharding.clone(),
            contexts,
            execution.clone(),
            failover.clone(),
        ));
        let executor = Arc::new(JobExecutor::new(job, facade, runtime.clone()));

        servers.persist_online(!effective.disabled).await?;
        instances.persist_online().await?;
        execution.clear_all_running_info().await?;
        sharding.set_resharding_flag().await?;
        leader.elect_if_needed().await?;

        let node = Arc::new(Self {
            runtime,
            storage,
            configs,
            instances,
            leader,
            sharding,
            execution,
            failover,
            reconcile,
            executor,
            coordinator,
            tasks: Mutex::new(Vec::new()),
            stopped: OnceCell::new(),
        });
        node.spawn_tasks(&effective).await?;

        tracing::info!(
            job = %node.job_name(),
            instance_id = %node.instance_id(),
            total = effective.sharding_total_count,
            strategy = %effective.job_sharding_strategy_type,
            "Job started"
        );
        Ok(node)
    }

    async fn spawn_tasks(self: &Arc<Self>, config: &JobConfig) -> Result<()> {
        let cancel = self.runtime.cancellation_token();
        let mut tasks = Vec::new();

        let listener = ListenerManager::new(self.storage.clone())
            .add_handler(Arc::new(ConfigChangedHandler::new(
                self.configs.clone(),
                self.sharding.clone(),
                self.failover.clone(),
            )))
            .add_handler(Arc::new(MembershipChangedHandler::new(self.sharding.clone())))
            .add_handler(Arc::new(LeaderElectionHandler::new(
                self.leader.clone(),
                self.instances.clone(),
                self.runtime.clone(),
            )))
            .add_handler(Arc::new(FailoverHandler::new(
                self.failover.clone(),
                self.runtime.clone(),
            )))
            .add_handler(Arc::new(TriggerHandler::new(
                self.storage.clone(),
                self.runtime.clone(),
            )))
            .add_handler(Arc::new(ShutdownHandler::new(
                self.storage.clone(),
                self.runtime.clone(),
            )))
            .with_state_handler(Arc::new(ConnectionStateHandler::new(
                self.runtime.clone(),
                self.configs.clone(),
                self.instances.clone(),
                self.execution.clone(),
                self.sharding.clone(),
                self.leader.clone(),
                self.coordinator.clone(),
            )));
        tasks.push(listener.start(cancel.clone()).await?);

        if config.reconcile_interval_minutes > 0 {
            let reconcile = self.reconcile.clone();
            let period = Duration::from_secs(config.reconcile_interval_minutes * 60);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                reconcile.run(period, cancel).await;
            }));
        }

        let node = self.clone();
        let interval_ms = config.execution_interval_ms;
        tasks.push(tokio::spawn(async move {
            node.execution_loop(interval_ms).await;
        }));

        *self.tasks.lock().await = tasks;

        // Tear down however shutdown was requested: stop(), a shutdown node,
        // or the process signal handler.
        let node = self.clone();
        tokio::spawn(async move {
            node.runtime.cancellation_token().cancelled().await;
            node.teardown().await;
        });
        Ok(())
    }

    /// Runs on every tick and trigger until cancelled. A run in flight is
    /// allowed to finish.
    async fn execution_loop(self: Arc<Self>, interval_ms: u64) {
        let cancel = self.runtime.cancellation_token();
        let mut ticker = (interval_ms > 0).then(|| {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.runtime.triggered() => {}
                _ = next_tick(&mut ticker) => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            if self.runtime.is_suspended() {
                tracing::debug!(job = %self.job_name(), "Registry connection suspended, run skipped");
                continue;
            }
            match self.executor.execute().await {
                Ok(summary) if !summary.executed.is_empty() => {
                    tracing::debug!(
                        job = %self.job_name(),
                        items = ?summary.executed,
                        failed = ?summary.failed,
                        "Run finished"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(job = %self.job_name(), error = %e, "Run failed");
                }
            }
        }
    }

    pub fn job_name(&self) -> &str {
        self.runtime.job_name()
    }

    pub fn instance_id(&self) -> &str {
        self.runtime.instance_id()
    }

    pub fn runtime(&self) -> &Arc<JobRuntime> {
        &self.runtime
    }

    pub fn storage(&self) -> &JobNodeStorage {
        &self.storage
    }

    pub fn configs(&self) -> &Arc<ConfigService> {
        &self.configs
    }

    pub fn instances(&self) -> &Arc<InstanceService> {
        &self.instances
    }

    pub fn leader(&self) -> &Arc<LeaderService> {
        &self.leader
    }

    pub fn sharding(&self) -> &Arc<ShardingService> {
        &self.sharding
    }

    pub fn execution(&self) -> &Arc<ExecutionService> {
        &self.execution
    }

    pub fn failover(&self) -> &Arc<FailoverService> {
        &self.failover
    }

    pub fn reconcile(&self) -> &Arc<ReconcileService> {
        &self.reconcile
    }

    pub fn facade(&self) -> &Arc<JobFacade> {
        self.executor.facade()
    }

    pub async fn is_leader(&self) -> Result<bool> {
        self.leader.is_leader().await
    }

    /// Ask the execution loop for an immediate run.
    pub fn trigger(&self) {
        self.runtime.request_trigger();
    }

    /// Run once now, outside the execution loop.
    pub async fn run_once(&self) -> Result<ExecutionSummary> {
        if self.runtime.is_shutdown() {
            return Err(CoordError::Shutdown(self.job_name().to_string()));
        }
        self.executor.execute().await
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.initialized()
    }

    /// Stop gracefully and wait until presence is withdrawn.
    pub async fn stop(&self) {
        self.runtime.begin_shutdown();
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.stopped
            .get_or_init(|| async {
                let tasks = std::mem::take(&mut *self.tasks.lock().await);
                for task in tasks {
                    if let Err(e) = task.await {
                        tracing::warn!(job = %self.job_name(), error = %e, "Job task ended abnormally");
                    }
                }
                if let Err(e) = self.leader.remove_leader().await {
                    tracing::warn!(job = %self.job_name(), error = %e, "Failed to release leadership");
                }
                if let Err(e) = self.execution.clear_all_running_info().await {
                    tracing::warn!(job = %self.job_name(), error = %e, "Failed to clear running markers");
                }
                if let Err(e) = self.instances.remove_instance().await {
                    tracing::warn!(job = %self.job_name(), error = %e, "Failed to remove instance");
                }
                tracing::info!(job = %self.job_name(), instance_id = %self.instance_id(), "Job stopped");
            })
            .await;
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
