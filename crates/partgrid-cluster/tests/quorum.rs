//! Quorum gating: below the service quorum requests are refused and the
//! ownership map stays frozen

mod common;

use common::LocalCluster;
use partgrid_cluster::{
    ClusterError, GridConfig, PartitionId, QuorumConfig, RetryConfig, ServiceStatus,
};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_suspended_below_service_quorum() {
    let mut cluster = LocalCluster::start(3, |_| {
        GridConfig::builder()
            .partition_count(16)
            .backup_count(1)
            .quorum(QuorumConfig::new(3, 1, 3))
    })
    .await;
    cluster.await_settled().await;

    let client = cluster.member(1).clone();
    client.put(b"before".to_vec(), b"1".to_vec()).await.unwrap();
    let versions: Vec<u64> = cluster.members.values().map(|m| m.map_version()).collect();

    cluster.kill(3);
    tokio::time::sleep(Duration::from_millis(300)).await;

    for member in cluster.members.values() {
        assert_eq!(member.service_status(), ServiceStatus::Suspended);
        assert!(!member.health().is_healthy());
    }
    let err = client.put(b"during".to_vec(), b"2".to_vec()).await.unwrap_err();
    assert!(matches!(
        err,
        ClusterError::ServiceSuspended {
            required: 3,
            live: 2
        }
    ));
    let err = client.get(b"before").await.unwrap_err();
    assert!(matches!(err, ClusterError::ServiceSuspended { .. }));

    // no ownership change while suspended, not even the emergency path
    let orphaned = client
        .map_snapshot()
        .partitions
        .iter()
        .position(|e| e.primary == Some(3))
        .unwrap() as PartitionId;
    let err = client.emergency_promote(orphaned).await.unwrap_err();
    assert!(matches!(err, ClusterError::ServiceSuspended { .. }));

    let after: Vec<u64> = cluster.members.values().map(|m| m.map_version()).collect();
    assert_eq!(after, versions[..2].to_vec());

    // a replacement restores the quorum and the grid resumes
    cluster.add_member(4).await;
    cluster.await_settled().await;
    assert_eq!(client.service_status(), ServiceStatus::Running);
    assert_eq!(client.get(b"before").await.unwrap(), Some(b"1".to_vec()));
    client.put(b"during".to_vec(), b"2".to_vec()).await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_distribution_before_recovery_quorum() {
    let mut cluster = LocalCluster::start(2, |_| {
        GridConfig::builder()
            .partition_count(8)
            .quorum(QuorumConfig::new(1, 1, 3))
            .client_retry(RetryConfig::fixed_delay(2, Duration::from_millis(10)))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let first = cluster.member(1).clone();
    assert_eq!(first.service_status(), ServiceStatus::Recovering);
    assert_eq!(first.map_version(), 0);
    assert!(first.local_partitions().is_empty());
    let err = first.put(b"k".to_vec(), b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, ClusterError::RetriesExhausted { .. }));

    cluster.add_member(3).await;
    cluster.await_settled().await;
    assert_eq!(first.service_status(), ServiceStatus::Running);
    assert_eq!(first.distribution_stats().total_primaries, 8);

    cluster.shutdown().await;
}
