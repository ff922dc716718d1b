use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config_service::ConfigService;
use crate::election::LeaderService;
use crate::error::Result;
use crate::failover::FailoverService;
use crate::instance::InstanceService;
use crate::sharding::ShardingService;

/// What one reconciliation pass found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The pass ran (this instance leads).
    pub performed: bool,
    pub resharding_requested: bool,
    pub orphaned_items: Vec<u32>,
}

/// Periodic leader-only repair of distributed state:
/// 1. Assignments pointing at dead instances, or items with no owner, raise
///    the resharding flag
/// 2. Running markers of dead instances are reclaimed for failover
#[derive(Debug, Clone)]
pub struct ReconcileService {
    leader: Arc<LeaderService>,
    sharding: Arc<ShardingService>,
    failover: Arc<FailoverService>,
    instances: Arc<InstanceService>,
    configs: Arc<ConfigService>,
}

impl ReconcileService {
    pub fn new(
        leader: Arc<LeaderService>,
        sharding: Arc<ShardingService>,
        failover: Arc<FailoverService>,
        instances: Arc<InstanceService>,
        configs: Arc<ConfigService>,
    ) -> Self {
        Self {
            leader,
            sharding,
            failover,
            instances,
            configs,
        }
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if !self.leader.is_leader().await? {
            return Ok(report);
        }
        report.performed = true;

        if !self.sharding.is_need_sharding().await?
            && (self.sharding.has_sharding_info_in_offline_servers().await?
                || self.sharding.has_unassigned_items().await?)
        {
            tracing::info!(job = %self.sharding.job_name(), "Reconcile found stale sharding assignment");
            self.sharding.set_resharding_flag().await?;
            report.resharding_requested = true;
        }

        if self.configs.load(true).await?.monitor_execution {
            let live: HashSet<String> = self
                .instances
                .get_live_instance_ids()
                .await?
                .into_iter()
                .collect();
            report.orphaned_items = self.failover.enqueue_orphans(&live).await?;
            if !report.orphaned_items.is_empty() {
                tracing::info!(
                    job = %self.sharding.job_name(),
                    items = ?report.orphaned_items,
                    "Reconcile reclaimed orphaned items"
                );
            }
        }
        Ok(report)
    }

    /// Reconcile every `period` until cancelled. Failures are logged and the
    /// next tick tries again.
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately; skip it so startup is not a pass.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        tracing::warn!(job = %self.sharding.job_name(), error = %e, "Reconcile pass failed");
                    }
                }
            }
        }
    }
}
