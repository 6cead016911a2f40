//! Member failure handling
//!
//! - Backups take over when a primary dies
//! - Partitions without any copy are declared lost exactly once
//! - Lost partitions can be recreated empty

mod common;

use common::{drain, LocalCluster};
use partgrid_cluster::{ClusterError, ClusterTransport, GridEvent, PartitionId};
use std::collections::BTreeSet;

fn key(i: usize) -> Vec<u8> {
    format!("key-{}", i).into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backup_takes_over_after_member_failure() {
    let mut cluster = LocalCluster::uniform(3, 257, 1).await;
    cluster.await_settled().await;

    let client = cluster.member(2).clone();
    for i in 0..300 {
        client.put(key(i), format!("value-{}", i)).await.unwrap();
    }

    let mut events = cluster.subscribe_all();
    cluster.kill(1);
    cluster.await_settled().await;

    let snapshot = client.map_snapshot();
    assert!(snapshot.lost.is_empty());
    for (p, entry) in snapshot.partitions.iter().enumerate() {
        let primary = entry.primary.expect("every partition has a primary");
        assert!(primary == 2 || primary == 3, "partition {} on {}", p, primary);
        assert_eq!(entry.backups.len(), 1, "partition {} backups", p);
        assert_ne!(entry.backups[0], primary);
    }

    let events = drain(&mut events);
    assert!(!events.iter().any(GridEvent::is_data_loss));
    assert!(events
        .iter()
        .any(|e| matches!(e, GridEvent::PrimaryPromoted { .. })));

    for i in 0..300 {
        let value = client.get(&key(i)).await.unwrap();
        assert_eq!(value, Some(format!("value-{}", i).into_bytes()));
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_data_loss_reported_once_per_partition() {
    let mut cluster = LocalCluster::uniform(3, 257, 0).await;
    cluster.await_settled().await;

    let owned_by_first: BTreeSet<PartitionId> = cluster
        .member(2)
        .map_snapshot()
        .partitions
        .iter()
        .enumerate()
        .filter(|(_, e)| e.primary == Some(1))
        .map(|(p, _)| p as PartitionId)
        .collect();
    assert_eq!(owned_by_first.len(), 86);

    let mut events = cluster.subscribe_all();
    cluster.kill(1);
    cluster.await_settled().await;

    let lost: Vec<PartitionId> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            GridEvent::DataLoss { partition } => Some(partition),
            _ => None,
        })
        .collect();
    assert_eq!(lost.len(), 86);
    let distinct: BTreeSet<PartitionId> = lost.into_iter().collect();
    assert_eq!(distinct, owned_by_first);

    let survivor = cluster.member(3);
    assert_eq!(survivor.map_snapshot().lost, owned_by_first);
    assert_eq!(survivor.health().lost_partitions, 86);
    assert_eq!(survivor.health().status(), "unhealthy");

    // a key in a lost partition surfaces the loss instead of retrying
    let lost_key = (0..)
        .map(key)
        .find(|k| owned_by_first.contains(&survivor.partition_for(k)))
        .unwrap();
    let err = survivor.put(lost_key, b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, ClusterError::DataLoss { .. }));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recreate_lost_partitions() {
    let mut cluster = LocalCluster::uniform(3, 12, 0).await;
    cluster.await_settled().await;

    let mut events = cluster.subscribe_all();
    cluster.kill(1);
    cluster.await_settled().await;

    let senior = cluster.member(2).clone();
    assert!(senior.view().is_senior());
    let lost = senior.map_snapshot().lost.clone();
    assert_eq!(lost.len(), 4);

    // only the senior may recreate
    let err = cluster
        .member(3)
        .recreate_lost_partitions()
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::NotSenior { senior: Some(2) }));

    let recreated = senior.recreate_lost_partitions().await.unwrap();
    assert_eq!(recreated.into_iter().collect::<BTreeSet<_>>(), lost);
    cluster.await_settled().await;

    let snapshot = cluster.member(3).map_snapshot();
    assert!(snapshot.lost.is_empty());
    assert!(snapshot.partitions.iter().all(|e| e.primary.is_some()));
    assert_eq!(senior.distribution_stats().primary_max, 6);

    let recreated_events = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, GridEvent::PartitionRecreated { .. }))
        .count();
    assert_eq!(recreated_events, 4);

    // recreated partitions start empty and accept writes
    let lost_key = (0..)
        .map(key)
        .find(|k| lost.contains(&senior.partition_for(k)))
        .unwrap();
    assert_eq!(senior.get(&lost_key).await.unwrap(), None);
    senior.put(lost_key.clone(), b"fresh".to_vec()).await.unwrap();
    assert_eq!(
        cluster.member(3).get(&lost_key).await.unwrap(),
        Some(b"fresh".to_vec())
    );

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_emergency_promote_requires_dead_primary() {
    let mut cluster = LocalCluster::uniform(3, 6, 1).await;
    cluster.await_settled().await;

    let observer = cluster.member(3).clone();
    let snapshot = observer.map_snapshot();
    let (partition, entry) = snapshot
        .partitions
        .iter()
        .enumerate()
        .find(|(_, e)| e.primary == Some(2))
        .map(|(p, e)| (p as PartitionId, e.clone()))
        .unwrap();

    let err = observer.emergency_promote(partition).await.unwrap_err();
    assert!(matches!(err, ClusterError::InvalidAssignment { .. }));

    cluster.kill(2);
    // the senior may already have repaired the entry
    match observer.emergency_promote(partition).await {
        Ok(_)
        | Err(ClusterError::InvalidAssignment { .. })
        | Err(ClusterError::Conflict { .. }) => {}
        Err(e) => panic!("unexpected emergency promotion failure: {}", e),
    }
    cluster.await_settled().await;

    let primary = observer.map_snapshot().partitions[partition as usize]
        .primary
        .unwrap();
    assert!(cluster.members.contains_key(&primary));
    assert_ne!(entry.primary, Some(primary));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_not_acknowledged_without_live_backup() {
    let mut cluster = LocalCluster::uniform(2, 8, 1).await;
    cluster.await_settled().await;

    let primary = cluster.member(1).clone();
    let owned = (0..)
        .map(key)
        .find(|k| primary.route(k).ok() == Some(1))
        .unwrap();

    // member 2 stops answering but is not yet declared failed
    cluster.transport.detach(2);
    let err = primary
        .put(owned.clone(), b"unreplicated".to_vec())
        .await
        .unwrap_err();
    assert!(
        matches!(err, ClusterError::ReplicationFailed { ref backups, .. } if backups == &vec![2]),
        "unexpected error: {}",
        err
    );

    // once the failure is known the backup no longer blocks writes
    cluster.kill(2);
    cluster.await_settled().await;

    let previous = primary.put(owned.clone(), b"v2".to_vec()).await.unwrap();
    assert_eq!(previous, Some(b"unreplicated".to_vec()));
    assert_eq!(primary.get(&owned).await.unwrap(), Some(b"v2".to_vec()));

    cluster.shutdown().await;
}
