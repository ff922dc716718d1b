//! Sharding assignment tests.
//!
//! Tests cover:
//! - Initial assignment across live instances
//! - Rebalancing after membership and configuration changes
//! - Deferred resharding when no instance can take items
//! - What each instance is handed to run


use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use shard_lite::config_service::ConfigService;
use shard_lite::instance::ServerService;
use shard_lite::registry::MemoryRegistry;
use shard_lite::sharding::ShardingOutcome;
use test_harness::{
    assert_eventually, test_instance, test_job_config, BareInstance, TestCluster, JOB,
};

const SETTLE: Duration = Duration::from_secs(5);

/// Test 1: Three items over three instances give one item each.
#[tokio::test]
async fn test_one_item_per_instance() {
    let mut cluster = TestCluster::new(3, test_job_config(3)).await;
    assert!(cluster.settle(SETTLE).await, "Assignment should settle");

    let assignment = cluster.assignment().await;
    assert_eq!(assignment.len(), 3);
    for index in 0..3 {
        assert_eq!(
            cluster.get(index).items().await,
            vec![index as u32],
            "Instance {} should own exactly its own item",
            index
        );
    }

    cluster.shutdown().await;
}

/// Test 2: Losing an instance rebalances its items over the survivors.
#[tokio::test]
async fn test_rebalance_after_instance_crash() {
    let mut cluster = TestCluster::new(3, test_job_config(3)).await;
    assert!(cluster.settle(SETTLE).await);

    cluster.crash(1).await;
    assert!(cluster.settle(SETTLE).await, "Assignment should settle after crash");

    assert_eq!(cluster.get(0).items().await, vec![0, 1]);
    assert_eq!(cluster.get(2).items().await, vec![2]);
    let owners: BTreeSet<String> = cluster.assignment().await.into_values().collect();
    assert!(!owners.contains(test_instance(1).instance_id.as_str()));

    cluster.shutdown().await;
}

/// Test 3: Ten items over three instances split 4/3/3, leftovers first.
#[tokio::test]
async fn test_uneven_split() {
    let mut cluster = TestCluster::new(3, test_job_config(10)).await;
    assert!(cluster.settle(SETTLE).await);

    assert_eq!(cluster.get(0).items().await, vec![0, 1, 2, 9]);
    assert_eq!(cluster.get(1).items().await, vec![3, 4, 5]);
    assert_eq!(cluster.get(2).items().await, vec![6, 7, 8]);

    cluster.shutdown().await;
}

/// Test 4: A new instance joining takes a share.
#[tokio::test]
async fn test_rebalance_after_instance_joins() {
    let mut cluster = TestCluster::new(1, test_job_config(4)).await;
    assert!(cluster.settle(SETTLE).await);
    assert_eq!(cluster.get(0).items().await, vec![0, 1, 2, 3]);

    let joined = cluster.add_instance().await;
    assert!(cluster.settle(SETTLE).await);

    assert_eq!(cluster.get(0).items().await, vec![0, 1]);
    assert_eq!(cluster.get(joined).items().await, vec![2, 3]);

    cluster.shutdown().await;
}

/// Test 5: Recomputing with the same membership moves nothing.
#[tokio::test]
async fn test_reshard_without_change_is_stable() {
    let mut cluster = TestCluster::new(3, test_job_config(7)).await;
    assert!(cluster.settle(SETTLE).await);
    let before = cluster.assignment().await;

    cluster.get(0).node.sharding().set_resharding_flag().await.unwrap();
    assert!(cluster.settle(SETTLE).await);

    assert_eq!(cluster.assignment().await, before);
    cluster.shutdown().await;
}

/// Test 6: Raising the item count through the registry reshards every
/// instance onto the new range; lowering it drops the extra items.
#[tokio::test]
async fn test_total_count_change_reshards() {
    let mut cluster = TestCluster::new(2, test_job_config(2)).await;
    assert!(cluster.settle(SETTLE).await);

    let operator = ConfigService::new(cluster.operator_storage());
    operator.update(&test_job_config(6)).await.unwrap();
    assert_eventually(
        || async { cluster.get(0).node.sharding().is_need_sharding().await.unwrap() },
        Duration::from_secs(2),
        "Config change should request resharding",
    )
    .await;
    assert!(cluster.settle(SETTLE).await);
    assert_eq!(
        cluster.assignment().await.keys().copied().collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4, 5]
    );

    operator.update(&test_job_config(3)).await.unwrap();
    assert_eventually(
        || async { cluster.get(1).node.sharding().is_need_sharding().await.unwrap() },
        Duration::from_secs(2),
        "Config change should request resharding",
    )
    .await;
    assert!(cluster.settle(SETTLE).await);
    assert_eq!(
        cluster.get(0).node.sharding().existing_items().await.unwrap(),
        vec![0, 1, 2]
    );

    cluster.shutdown().await;
}

/// Test 7: With every server disabled resharding is deferred, and the flag
/// stays set for when one comes back.
#[tokio::test]
async fn test_no_available_instances_keeps_flag() {
    let registry = MemoryRegistry::new();
    let config = test_job_config(3);
    let a = BareInstance::start(&registry, 0, &config).await;

    a.servers.disable_server(a.servers.local_ip()).await.unwrap();
    assert_eq!(
        a.sharding.sharding_if_necessary().await.unwrap(),
        ShardingOutcome::NoAvailableInstances
    );
    assert!(a.sharding.is_need_sharding().await.unwrap());
    assert!(a.sharding.get_sharding_assignment().await.unwrap().is_empty());

    a.servers.enable_server(a.servers.local_ip()).await.unwrap();
    a.leader.elect_if_needed().await.unwrap();
    assert_eq!(
        a.sharding.sharding_if_necessary().await.unwrap(),
        ShardingOutcome::Sharded
    );
    assert!(!a.sharding.is_need_sharding().await.unwrap());
    assert_eq!(a.sharding.get_local_sharding_items().await.unwrap(), vec![0, 1, 2]);
}

/// Test 8: Followers leave resharding to the leader and run nothing while it
/// is pending.
#[tokio::test]
async fn test_follower_waits_for_leader() {
    let registry = MemoryRegistry::new();
    let config = test_job_config(4);
    let leader = BareInstance::start(&registry, 0, &config).await;
    let follower = BareInstance::start(&registry, 1, &config).await;
    assert!(leader.leader.is_leader().await.unwrap());

    assert_eq!(
        follower.sharding.sharding_if_necessary().await.unwrap(),
        ShardingOutcome::NotLeader
    );
    assert!(follower.facade.get_sharding_contexts().await.unwrap().is_empty());

    assert_eq!(
        leader.sharding.sharding_if_necessary().await.unwrap(),
        ShardingOutcome::Sharded
    );
    let contexts = follower.facade.get_sharding_contexts().await.unwrap();
    assert_eq!(contexts.items(), vec![2, 3]);

    follower.sharding.set_resharding_flag().await.unwrap();
    assert!(
        follower.facade.get_sharding_contexts().await.unwrap().is_empty(),
        "Stale assignment must not run while resharding is pending"
    );
}

/// Test 9: Disabled items are assigned but not run.
#[tokio::test]
async fn test_disabled_item_is_skipped() {
    let registry = MemoryRegistry::new();
    let a = BareInstance::start(&registry, 0, &test_job_config(3)).await;

    a.execution.disable_item(1).await.unwrap();
    let contexts = a.facade.get_sharding_contexts().await.unwrap();
    assert_eq!(contexts.items(), vec![0, 2]);

    a.execution.enable_item(1).await.unwrap();
    let contexts = a.facade.get_sharding_contexts().await.unwrap();
    assert_eq!(contexts.items(), vec![0, 1, 2]);
}

/// Test 10: Each context carries its own item parameter and the job parameter.
#[tokio::test]
async fn test_context_parameters() {
    let registry = MemoryRegistry::new();
    let config = test_job_config(3)
        .with_item_parameters("0=Beijing,1=Shanghai")
        .with_job_parameter("batch=10");
    let a = BareInstance::start(&registry, 0, &config).await;

    let contexts = a.facade.get_sharding_contexts().await.unwrap();
    assert_eq!(contexts.job_name, JOB);
    assert_eq!(contexts.sharding_total_count, 3);
    assert_eq!(contexts.sharding_context(0).sharding_parameter, "Beijing");
    assert_eq!(contexts.sharding_context(1).sharding_parameter, "Shanghai");
    assert_eq!(contexts.sharding_context(2).sharding_parameter, "");
    assert_eq!(contexts.sharding_context(2).job_parameter, "batch=10");
    assert!(contexts.task_id.starts_with(JOB));
}

/// Test 11: A label restricts which instances receive items.
#[tokio::test]
async fn test_label_filters_instances() {
    let mut cluster = TestCluster::new(0, test_job_config(4).with_label("blue")).await;
    let plain = cluster.start_instance(0, test_instance(0)).await;
    let labelled = cluster
        .start_instance(1, test_instance(1).with_labels("blue,green"))
        .await;
    cluster.instances.insert(0, plain);
    cluster.instances.insert(1, labelled);

    assert!(cluster.settle(SETTLE).await);
    assert!(cluster.get(0).items().await.is_empty());
    assert_eq!(cluster.get(1).items().await, vec![0, 1, 2, 3]);

    cluster.shutdown().await;
}

/// Test 12: Items held by a disabled server move to enabled ones.
#[tokio::test]
async fn test_disabled_server_loses_items() {
    let mut cluster = TestCluster::new(2, test_job_config(4)).await;
    assert!(cluster.settle(SETTLE).await);

    let servers = ServerService::new(cluster.operator_storage(), "operator");
    servers.disable_server(cluster.get(1).server_ip()).await.unwrap();
    assert_eventually(
        || async { cluster.get(0).node.sharding().is_need_sharding().await.unwrap() },
        Duration::from_secs(2),
        "Server status change should request resharding",
    )
    .await;
    assert!(cluster.settle(SETTLE).await);

    assert_eq!(cluster.get(0).items().await, vec![0, 1, 2, 3]);
    assert!(cluster.get(1).items().await.is_empty());

    cluster.shutdown().await;
}

/// Test 13: An instance lost while the leader waits for running items gets
/// nothing in the new assignment.
#[tokio::test]
async fn test_instance_lost_during_running_wait_is_excluded() {
    let registry = MemoryRegistry::new();
    let config = test_job_config(3);
    let a = BareInstance::start(&registry, 0, &config).await;
    let b = BareInstance::start(&registry, 1, &config).await;
    let c = BareInstance::start(&registry, 2, &config).await;
    assert!(a.leader.is_leader().await.unwrap());
    assert!(a.sharding.is_need_sharding().await.unwrap());

    b.execution.register_begin(&[1]).await.unwrap();
    let sharding = Arc::clone(&a.sharding);
    let pending = tokio::spawn(async move { sharding.sharding_if_necessary().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    c.crash().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.execution.register_complete(&[1]).await.unwrap();

    assert_eq!(pending.await.unwrap().unwrap(), ShardingOutcome::Sharded);
    assert!(!a.sharding.is_need_sharding().await.unwrap());
    let assignment = a.sharding.get_sharding_assignment().await.unwrap();
    assert_eq!(assignment.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(
        assignment.values().all(|owner| owner != c.instance_id()),
        "Crashed instance must not own items: {:?}",
        assignment
    );
}
