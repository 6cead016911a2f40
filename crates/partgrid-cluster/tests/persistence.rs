//! Cluster restart from persisted partition copies

mod common;

use common::LocalCluster;
use partgrid_cluster::{
    ClusterTransport, GridConfig, LocalTransport, MemoryBackend, PartitionedService,
    PersistenceBackend, PersistenceConfig, PersistenceMode, QuorumConfig, ServiceStatus,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

fn key(i: usize) -> Vec<u8> {
    format!("key-{}", i).into_bytes()
}

async fn start_single(backend: Arc<dyn PersistenceBackend>) -> Arc<PartitionedService> {
    let config = GridConfig::builder()
        .member_id(1)
        .partition_count(4)
        .backup_count(0)
        .persistence(PersistenceConfig {
            mode: PersistenceMode::OnDemand,
            ..Default::default()
        })
        .build();
    let transport: Arc<dyn ClusterTransport> = Arc::new(LocalTransport::default());
    PartitionedService::start_with_backend(config, transport, backend)
        .await
        .unwrap()
}

async fn await_running(member: &PartitionedService) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while member.service_status() != ServiceStatus::Running || !member.coordinator().is_idle() {
        assert!(Instant::now() < deadline, "member did not start serving");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_persistence_survives_full_restart() {
    let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
    let paths: Vec<PathBuf> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
    let template = move |id: u32| {
        GridConfig::builder()
            .partition_count(8)
            .backup_count(1)
            .quorum(QuorumConfig::new(1, 1, 2))
            .persistence(PersistenceConfig::active(paths[id as usize - 1].clone()))
    };

    let cluster = LocalCluster::start(2, template.clone()).await;
    cluster.await_settled().await;
    let client = cluster.member(1).clone();
    for i in 0..40 {
        client.put(key(i), format!("value-{}", i)).await.unwrap();
    }
    client.remove(&key(7)).await.unwrap();
    client.put(key(3), b"updated".to_vec()).await.unwrap();
    for member in cluster.members.values() {
        assert!(!member.persistence().stored_partitions().unwrap().is_empty());
    }
    cluster.shutdown().await;
    drop(client);

    let cluster = LocalCluster::start(2, template).await;
    cluster.await_settled().await;
    let client = cluster.member(2).clone();
    assert!(client.map_snapshot().lost.is_empty());
    for i in 0..40 {
        let expected = match i {
            7 => None,
            3 => Some(b"updated".to_vec()),
            _ => Some(format!("value-{}", i).into_bytes()),
        };
        assert_eq!(client.get(&key(i)).await.unwrap(), expected, "key {}", i);
    }
    assert_eq!(client.health().under_replicated_partitions, 0);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_on_demand_snapshot_roundtrip() {
    let backend: Arc<dyn PersistenceBackend> = Arc::new(MemoryBackend::new());

    let member = start_single(backend.clone()).await;
    await_running(&member).await;
    for i in 0..20 {
        member.put(key(i), b"snapshotted".to_vec()).await.unwrap();
    }
    assert_eq!(member.snapshot_all().await.unwrap(), 4);
    // not part of any snapshot
    member.put(key(100), b"late".to_vec()).await.unwrap();
    member.halt();
    drop(member);

    let member = start_single(backend).await;
    await_running(&member).await;
    assert!(member.map_snapshot().lost.is_empty());
    for i in 0..20 {
        assert_eq!(member.get(&key(i)).await.unwrap(), Some(b"snapshotted".to_vec()));
    }
    assert_eq!(member.get(&key(100)).await.unwrap(), None);
    member.halt();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partitions_without_stored_copy_are_lost() {
    let backend: Arc<dyn PersistenceBackend> = Arc::new(MemoryBackend::new());

    let member = start_single(backend.clone()).await;
    await_running(&member).await;
    member.put(key(1), b"v".to_vec()).await.unwrap();
    let kept = member.partition_for(&key(1));
    member.snapshot_partition(kept).await.unwrap();
    member.halt();
    drop(member);

    let member = start_single(backend).await;
    await_running(&member).await;
    let expected: BTreeSet<u32> = (0..4).filter(|p| *p != kept).collect();
    assert_eq!(member.map_snapshot().lost, expected);
    assert_eq!(member.get(&key(1)).await.unwrap(), Some(b"v".to_vec()));
    assert_eq!(member.health().lost_partitions, 3);
    member.halt();
}
