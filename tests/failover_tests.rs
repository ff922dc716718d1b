//! Failover tests.
//!
//! Tests cover:
//! - Queueing abandoned items, idempotently
//! - Crash detection by reconciliation and by membership events
//! - Exclusive claims: one winner per item, nothing while busy
//! - Requeueing items whose job code failed


use std::sync::Arc;
use std::time::Duration;

use shard_lite::config_service::ConfigService;
use shard_lite::registry::MemoryRegistry;
use shard_lite::storage::JobNodePath;
use test_harness::{assert_eventually, test_job_config, BareInstance, TestCluster};

const SETTLE: Duration = Duration::from_secs(5);

/// Test 1: Queueing an item twice leaves one entry.
#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let registry = MemoryRegistry::new();
    let a = BareInstance::start(&registry, 0, &test_job_config(3).with_failover(true)).await;

    assert!(a.failover.enqueue(2).await.unwrap());
    assert!(!a.failover.enqueue(2).await.unwrap());
    assert_eq!(a.failover.queued_items().await.unwrap(), vec![2]);
}

/// Test 2: Reconciliation finds the item a crashed instance left running,
/// queues it once, and a survivor claims it.
#[tokio::test]
async fn test_reconcile_reclaims_crashed_item() {
    let registry = MemoryRegistry::new();
    let config = test_job_config(3).with_failover(true);
    let b = BareInstance::start(&registry, 1, &config).await;
    let a = BareInstance::start(&registry, 0, &config).await;
    assert!(b.leader.is_leader().await.unwrap());

    a.execution.register_begin(&[2]).await.unwrap();
    a.crash().await;

    let report = b.reconcile.reconcile_once().await.unwrap();
    assert!(report.performed);
    assert_eq!(report.orphaned_items, vec![2]);
    assert_eq!(b.failover.queued_items().await.unwrap(), vec![2]);
    assert!(!b.execution.is_running(2).await.unwrap(), "Dead marker should be cleared");

    let again = b.reconcile.reconcile_once().await.unwrap();
    assert!(again.orphaned_items.is_empty(), "Item must be queued only once");
    assert_eq!(b.failover.queued_items().await.unwrap(), vec![2]);

    assert_eq!(b.failover.dequeue().await.unwrap(), Some(2));
    assert!(b.failover.queued_items().await.unwrap().is_empty());
}

/// Test 3: Only the leader reconciles.
#[tokio::test]
async fn test_follower_does_not_reconcile() {
    let registry = MemoryRegistry::new();
    let config = test_job_config(3).with_failover(true);
    let leader = BareInstance::start(&registry, 0, &config).await;
    let follower = BareInstance::start(&registry, 1, &config).await;
    assert!(leader.leader.is_leader().await.unwrap());

    let report = follower.reconcile.reconcile_once().await.unwrap();
    assert!(!report.performed);
}

/// Test 4: Items still running on a live instance are never claimed.
#[tokio::test]
async fn test_dequeue_skips_items_running_on_live_instance() {
    let registry = MemoryRegistry::new();
    let config = test_job_config(3).with_failover(true);
    let a = BareInstance::start(&registry, 0, &config).await;
    let b = BareInstance::start(&registry, 1, &config).await;

    a.execution.register_begin(&[1]).await.unwrap();
    b.failover.enqueue(1).await.unwrap();
    assert_eq!(b.failover.dequeue().await.unwrap(), None);
    assert_eq!(b.failover.queued_items().await.unwrap(), vec![1]);

    a.execution.register_complete(&[1]).await.unwrap();
    assert_eq!(b.failover.dequeue().await.unwrap(), Some(1));
}

/// Test 5: Nothing is claimed while the job is executing locally.
#[tokio::test]
async fn test_dequeue_waits_while_running_locally() {
    let registry = MemoryRegistry::new();
    let b = BareInstance::start(&registry, 1, &test_job_config(3).with_failover(true)).await;
    b.failover.enqueue(0).await.unwrap();

    assert!(b.runtime.begin_running());
    assert_eq!(b.failover.dequeue().await.unwrap(), None);
    b.runtime.end_running();
    assert_eq!(b.failover.dequeue().await.unwrap(), Some(0));
}

/// Test 6: Two instances racing for one item: exactly one wins.
#[tokio::test]
async fn test_concurrent_dequeue_has_one_winner() {
    let registry = MemoryRegistry::new();
    let config = test_job_config(3).with_failover(true);
    let b = Arc::new(BareInstance::start(&registry, 1, &config).await);
    let c = Arc::new(BareInstance::start(&registry, 2, &config).await);
    b.failover.enqueue(0).await.unwrap();

    let (first, second) = tokio::join!(
        {
            let b = b.clone();
            async move { b.failover.failover_if_necessary().await.unwrap() }
        },
        {
            let c = c.clone();
            async move { c.failover.failover_if_necessary().await.unwrap() }
        }
    );
    let winners = [first, second].iter().filter(|r| r.is_some()).count();
    assert_eq!(winners, 1, "Exactly one instance should claim the item");
    assert!(b.failover.queued_items().await.unwrap().is_empty());
}

/// Test 7: The claimant records the takeover, runs the item alone, and the
/// regular owner leaves it alone until it completes.
#[tokio::test]
async fn test_takeover_excludes_item_from_owner() {
    let registry = MemoryRegistry::new();
    let config = test_job_config(2).with_failover(true);
    let owner = BareInstance::start(&registry, 0, &config).await;
    let rescuer = BareInstance::start(&registry, 1, &config).await;
    owner.sharding.sharding_if_necessary().await.unwrap();
    assert_eq!(owner.sharding.get_local_sharding_items().await.unwrap(), vec![0]);

    owner.failover.enqueue(0).await.unwrap();
    assert_eq!(rescuer.failover.failover_if_necessary().await.unwrap(), Some(0));
    assert_eq!(
        owner
            .storage
            .get_job_node_data(&JobNodePath::failover_node(0))
            .await
            .unwrap()
            .as_deref(),
        Some(rescuer.instance_id())
    );

    let rescuer_contexts = rescuer.facade.get_sharding_contexts().await.unwrap();
    assert_eq!(rescuer_contexts.items(), vec![0], "Failover items run first and alone");
    assert!(owner.facade.get_sharding_contexts().await.unwrap().is_empty());

    rescuer.facade.register_job_begin(&rescuer_contexts).await.unwrap();
    rescuer.facade.register_job_completed(&rescuer_contexts).await.unwrap();
    assert!(rescuer.failover.get_local_failover_items().await.unwrap().is_empty());
    assert_eq!(owner.facade.get_sharding_contexts().await.unwrap().items(), vec![0]);
}

/// Test 8: Failed items are requeued only when failover is on.
#[tokio::test]
async fn test_post_job_execution_error() {
    let registry = MemoryRegistry::new();
    let a = BareInstance::start(&registry, 0, &test_job_config(3)).await;
    a.facade.post_job_execution_error(&[1]).await.unwrap();
    assert!(a.failover.queued_items().await.unwrap().is_empty());

    let registry = MemoryRegistry::new();
    let a = BareInstance::start(&registry, 0, &test_job_config(3).with_failover(true)).await;
    a.facade.post_job_execution_error(&[1, 2]).await.unwrap();
    assert_eq!(a.failover.queued_items().await.unwrap(), vec![1, 2]);
}

/// Test 9: A crash seen by the listeners is reclaimed without waiting for
/// reconciliation, and a survivor takes the item over.
#[tokio::test]
async fn test_crash_event_triggers_failover() {
    let config = test_job_config(3).with_failover(true);
    let mut cluster = TestCluster::new(3, config).await;
    assert!(cluster.settle(SETTLE).await);

    let victim = cluster.get(1).node.clone();
    victim.execution().register_begin(&[1]).await.unwrap();
    cluster.crash(1).await;

    let storage = cluster.operator_storage();
    assert_eventually(
        || async {
            let taker = storage
                .get_job_node_data(&JobNodePath::failover_node(1))
                .await
                .unwrap();
            let executed = cluster.get(0).job.executions_of(1) + cluster.get(2).job.executions_of(1);
            taker.is_some() || executed > 0
        },
        Duration::from_secs(3),
        "A survivor should take over the crashed instance's item",
    )
    .await;
    assert_eventually(
        || async {
            storage.get_job_node_data(&JobNodePath::running_node(1)).await.unwrap().as_deref()
                != Some(victim.instance_id())
        },
        Duration::from_secs(2),
        "Crashed instance's running marker should be cleared",
    )
    .await;

    cluster.shutdown().await;
}

/// Test 10: A job error with failover on requeues the item and some instance
/// runs it again.
#[tokio::test]
async fn test_failed_item_is_retried_through_failover() {
    let config = test_job_config(2).with_failover(true);
    let mut cluster = TestCluster::new(2, config).await;
    assert!(cluster.settle(SETTLE).await);

    let owner = cluster.get(0);
    owner.job.fail_items(&[0]);
    let summary = owner.node.run_once().await.unwrap();
    assert_eq!(summary.failed, vec![0]);

    assert_eventually(
        || async {
            cluster.get(0).job.executions_of(0) + cluster.get(1).job.executions_of(0) >= 2
        },
        Duration::from_secs(3),
        "Failed item should run again after failover",
    )
    .await;

    cluster.shutdown().await;
}

/// Test 11: Turning failover off drops queued work and takeover records.
#[tokio::test]
async fn test_disabling_failover_clears_queue() {
    let mut cluster = TestCluster::new(1, test_job_config(2).with_failover(true)).await;
    assert!(cluster.settle(SETTLE).await);
    let node = cluster.get(0).node.clone();
    // Keep the item queued: claims are skipped while running locally.
    assert!(node.runtime().begin_running());
    node.failover().enqueue(1).await.unwrap();

    let operator = ConfigService::new(cluster.operator_storage());
    operator.update(&test_job_config(2).with_failover(false)).await.unwrap();

    assert_eventually(
        || async { node.failover().queued_items().await.unwrap().is_empty() },
        Duration::from_secs(2),
        "Failover queue should be dropped",
    )
    .await;
    node.runtime().end_running();

    cluster.shutdown().await;
}
