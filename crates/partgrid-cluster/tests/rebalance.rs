//! Partition movement when members join
//!
//! - Primaries spread evenly over the storage members
//! - Every member converges on the same map
//! - Writes acknowledged during transfers survive them
//! - Ownership stays consistent through repeated joins and crashes
//! - Async backups catch up with their primaries

mod common;

use common::{drain, LocalCluster, SETTLE_TIMEOUT};
use partgrid_cluster::{
    BackupMode, GridConfig, GridEvent, MapSnapshot, MemberId, PartitionId, QuorumConfig,
    ReplicationConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

/// Every partition has one primary and distinct backups, all of them live
fn assert_consistent(snapshot: &MapSnapshot, live: &BTreeSet<MemberId>, observer: MemberId) {
    for (p, entry) in snapshot.partitions.iter().enumerate() {
        let primary = entry
            .primary
            .unwrap_or_else(|| panic!("member {}: partition {} has no primary", observer, p));
        let owners: BTreeSet<MemberId> = entry.backups.iter().copied().chain([primary]).collect();
        assert_eq!(
            owners.len(),
            entry.backups.len() + 1,
            "member {}: partition {} owners {:?}/{:?}",
            observer,
            p,
            primary,
            entry.backups
        );
        assert!(
            owners.is_subset(live),
            "member {}: partition {} held by departed member {:?}",
            observer,
            p,
            owners
        );
    }
    assert!(snapshot.lost.is_empty(), "member {}: lost {:?}", observer, snapshot.lost);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joining_member_receives_fair_share() {
    let mut cluster = LocalCluster::uniform(3, 257, 1).await;
    cluster.await_settled().await;

    let mut events = cluster.subscribe_all();
    cluster.add_member(4).await;
    cluster.await_settled().await;

    let snapshot = cluster.member(1).map_snapshot();
    let counts = snapshot.primary_counts();
    assert_eq!(counts.len(), 4);
    let max = counts.values().copied().max().unwrap();
    let min = counts.values().copied().min().unwrap();
    assert!(max - min <= 1, "primary counts {:?}", counts);

    let stats = cluster.member(1).distribution_stats();
    assert_eq!(stats.member_count, 4);
    assert_eq!(stats.total_primaries, 257);
    assert_eq!(stats.total_backups, 257);
    assert!(stats.is_balanced());

    let moved = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, GridEvent::TransferCompleted { destination: 4, .. }))
        .count();
    assert!(moved >= 64, "only {} transfers to the new member", moved);

    let newcomer = cluster.member(4);
    let held = newcomer.local_partitions();
    assert_eq!(held.len(), newcomer.health().owned_primaries + newcomer.health().owned_backups);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_maps_converge_after_membership_changes() {
    let mut cluster = LocalCluster::uniform(2, 32, 2).await;
    cluster.await_settled().await;

    cluster.add_member(3).await;
    cluster.add_member(4).await;
    cluster.await_settled().await;
    cluster.kill(2);
    cluster.await_settled().await;

    let reference = cluster.member(1).map_snapshot();
    for member in cluster.members.values() {
        assert_eq!(member.map_snapshot(), reference, "member {}", member.member_id());
    }
    for (p, entry) in reference.partitions.iter().enumerate() {
        assert!(entry.primary.is_some(), "partition {} has no primary", p);
        assert_eq!(entry.backups.len(), 2, "partition {} backups", p);
        assert!(!entry.holds(2));
    }
    assert!(reference.lost.is_empty());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writes_survive_concurrent_transfers() {
    let mut cluster = LocalCluster::uniform(2, 64, 1).await;
    cluster.await_settled().await;

    let client = cluster.member(1).clone();
    let writer = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            let mut acknowledged = HashMap::new();
            for round in 0..4 {
                for i in 0..150 {
                    let key = format!("key-{}", i);
                    let value = format!("value-{}-{}", i, round);
                    if client.put(key.clone(), value.clone()).await.is_ok() {
                        acknowledged.insert(key, value);
                    }
                }
            }
            acknowledged
        }
    });

    cluster.add_member(3).await;
    cluster.add_member(4).await;
    let acknowledged = writer.await.unwrap();
    cluster.await_settled().await;

    assert!(!acknowledged.is_empty());
    let reader = cluster.member(4).clone();
    for (key, value) in &acknowledged {
        let stored = reader.get(key.as_bytes()).await.unwrap();
        assert_eq!(stored.as_deref(), Some(value.as_bytes()), "key {}", key);
    }

    // primary and backup copies agree after the dust settles
    let snapshot = reader.map_snapshot();
    for (p, entry) in snapshot.partitions.iter().enumerate() {
        let partition = p as PartitionId;
        let primary = cluster.member(entry.primary.unwrap());
        let expected = primary.local_state(partition).await.unwrap();
        for backup in &entry.backups {
            let state = cluster.member(*backup).local_state(partition).await.unwrap();
            assert_eq!(state, expected, "partition {} on backup {}", partition, backup);
        }
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ownership_consistent_under_churn() {
    let mut cluster = LocalCluster::uniform(3, 32, 1).await;
    cluster.await_settled().await;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut receivers: HashMap<MemberId, broadcast::Receiver<GridEvent>> = cluster
        .members
        .iter()
        .map(|(id, m)| (*id, m.subscribe_events()))
        .collect();
    let mut installed: HashMap<MemberId, u64> = HashMap::new();
    let mut written = Vec::new();
    let mut next_id: MemberId = 4;

    for step in 0..10 {
        if cluster.members.len() > 2 && rng.gen_bool(0.5) {
            let ids: Vec<MemberId> = cluster.members.keys().copied().collect();
            let victim = ids[rng.gen_range(0..ids.len())];
            cluster.kill(victim);
            receivers.remove(&victim);
        } else {
            let member = cluster.add_member(next_id).await;
            receivers.insert(next_id, member.subscribe_events());
            next_id += 1;
        }
        cluster.await_settled().await;

        let live: BTreeSet<MemberId> = cluster.members.keys().copied().collect();
        let reference = cluster.any().map_snapshot();
        for (id, member) in &cluster.members {
            let snapshot = member.map_snapshot();
            assert_eq!(snapshot, reference, "step {}: member {} diverged", step, id);
            assert_consistent(&snapshot, &live, *id);
        }

        // each member only ever installs newer maps
        for (id, rx) in receivers.iter_mut() {
            for event in drain(std::slice::from_mut(rx)) {
                if let GridEvent::MapInstalled { version } = event {
                    let previous = installed.insert(*id, version);
                    assert!(
                        previous.map_or(true, |p| p < version),
                        "member {} installed {} after {:?}",
                        id,
                        version,
                        previous
                    );
                }
            }
        }

        let key = format!("churn-{}", step);
        cluster
            .any()
            .put(key.clone(), format!("step-{}", step))
            .await
            .unwrap();
        written.push(key);
    }

    let reader = cluster.any().clone();
    for (step, key) in written.iter().enumerate() {
        let stored = reader.get(key.as_bytes()).await.unwrap();
        assert_eq!(stored, Some(format!("step-{}", step).into_bytes()), "key {}", key);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_backups_catch_up() {
    let mut cluster = LocalCluster::start(2, |_| {
        GridConfig::builder()
            .partition_count(16)
            .backup_count(1)
            .quorum(QuorumConfig::new(1, 1, 2))
            .replication(ReplicationConfig {
                mode: BackupMode::Async,
                ..Default::default()
            })
    })
    .await;
    cluster.await_settled().await;

    let client = cluster.member(1).clone();
    for i in 0..200 {
        client
            .put(format!("key-{}", i), format!("value-{}", i))
            .await
            .unwrap();
    }
    cluster.await_settled().await;

    let snapshot = client.map_snapshot();
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let mut behind = Vec::new();
        for (p, entry) in snapshot.partitions.iter().enumerate() {
            let partition = p as PartitionId;
            let expected = cluster
                .member(entry.primary.unwrap())
                .local_state(partition)
                .await;
            for backup in &entry.backups {
                if cluster.member(*backup).local_state(partition).await != expected {
                    behind.push(partition);
                }
            }
        }
        if behind.is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "backups behind on {:?}", behind);
        sleep(Duration::from_millis(50)).await;
    }

    // the surviving copy serves everything the primary acknowledged
    cluster.kill(1);
    cluster.await_settled().await;
    let survivor = cluster.member(2).clone();
    for i in 0..200 {
        let stored = survivor.get(format!("key-{}", i).as_bytes()).await.unwrap();
        assert_eq!(stored, Some(format!("value-{}", i).into_bytes()));
    }

    cluster.shutdown().await;
}
