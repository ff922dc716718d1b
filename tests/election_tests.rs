//! Leader election tests.
//!
//! Tests cover:
//! - A single leader among instances started together
//! - Re-election after the leader crashes or stops
//! - Disabled servers giving up and never taking leadership


use std::sync::Arc;
use std::time::Duration;

use shard_lite::node::Node;
use shard_lite::registry::MemoryRegistry;
use test_harness::{
    assert_eventually, test_coordinator_config, test_instance, test_job_config, RecordingJob,
    TestCluster,
};

/// Test 1: Exactly one leader among three instances.
#[tokio::test]
async fn test_single_leader_elected() {
    let mut cluster = TestCluster::new(3, test_job_config(3)).await;

    let leader = cluster.wait_for_leader(Duration::from_secs(2)).await;
    assert!(leader.is_some(), "A leader should be elected");
    assert_eq!(cluster.count_leaders().await, 1, "Should have exactly 1 leader");

    cluster.shutdown().await;
}

/// Test 2: Instances racing to start on one registry still end up with one leader.
#[tokio::test]
async fn test_concurrent_starts_elect_one_leader() {
    let registry = MemoryRegistry::new();
    let mut handles = Vec::new();
    for index in 0..5 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let host = Node::with_instance(test_instance(index))
                .with_coordinator_config(test_coordinator_config());
            let node = host
                .start_job(
                    test_job_config(5),
                    Arc::new(RecordingJob::default()),
                    registry.session(),
                )
                .await
                .unwrap();
            (host, node)
        }));
    }
    let mut started = Vec::new();
    for handle in handles {
        started.push(handle.await.unwrap());
    }

    let mut leaders = 0;
    for (_, node) in &started {
        if node.is_leader().await.unwrap() {
            leaders += 1;
        }
    }
    assert_eq!(leaders, 1, "Should have exactly 1 leader");

    for (host, _) in &started {
        host.shutdown_all().await;
    }
}

/// Test 3: Another instance takes over when the leader's session dies.
#[tokio::test]
async fn test_reelection_after_leader_crash() {
    let mut cluster = TestCluster::new(3, test_job_config(3)).await;
    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("initial leader");

    cluster.crash(old_leader).await;

    let new_leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("New leader should be elected after crash");
    assert_ne!(new_leader, old_leader, "Crashed instance cannot stay leader");
    assert_eq!(cluster.count_leaders().await, 1);

    cluster.shutdown().await;
}

/// Test 4: A graceful stop hands leadership over as well.
#[tokio::test]
async fn test_reelection_after_leader_stop() {
    let mut cluster = TestCluster::new(2, test_job_config(2)).await;
    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("initial leader");

    let stopped = cluster.stop(old_leader).await.unwrap();
    assert!(stopped.node.is_stopped());
    assert!(!stopped.node.is_leader().await.unwrap());

    let new_leader = cluster.wait_for_leader(Duration::from_secs(3)).await;
    assert!(new_leader.is_some(), "Remaining instance should lead");
    assert_ne!(new_leader, Some(old_leader));

    cluster.shutdown().await;
}

/// Test 5: Disabling the leader's server makes it step down.
#[tokio::test]
async fn test_disabled_server_steps_down() {
    let mut cluster = TestCluster::new(2, test_job_config(2)).await;
    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("initial leader");
    let ip = cluster.get(old_leader).server_ip().to_string();

    cluster
        .get(old_leader)
        .node
        .instances()
        .servers()
        .disable_server(&ip)
        .await
        .unwrap();

    let old = cluster.get(old_leader);
    assert_eventually(
        || async { !old.is_leader().await },
        Duration::from_secs(2),
        "Leader on a disabled server should step down",
    )
    .await;
    assert_eventually(
        || async {
            matches!(cluster.leader_index().await, Some(index) if index != old_leader)
        },
        Duration::from_secs(3),
        "An enabled instance should take over",
    )
    .await;

    cluster.shutdown().await;
}

/// Test 6: With every server disabled nobody leads, and a blocking leader
/// check gives up instead of spinning.
#[tokio::test]
async fn test_no_leader_without_available_servers() {
    let mut cluster = TestCluster::new(1, test_job_config(1).with_disabled(true)).await;

    let node = &cluster.get(0).node;
    assert!(!node.leader().has_leader().await.unwrap());

    let started = tokio::time::Instant::now();
    assert!(!node.leader().is_leader_until_block().await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(2));

    cluster.shutdown().await;
}

/// Test 7: A stopped instance never wins an election.
#[tokio::test]
async fn test_stopped_instance_does_not_contend() {
    let mut cluster = TestCluster::new(2, test_job_config(2)).await;
    cluster.wait_for_leader(Duration::from_secs(2)).await;
    let follower = if cluster.get(0).is_leader().await { 1 } else { 0 };

    let stopped = cluster.stop(follower).await.unwrap();
    assert!(!stopped.node.leader().elect_if_needed().await.unwrap());
    assert_eq!(cluster.count_leaders().await, 1);

    cluster.shutdown().await;
}
