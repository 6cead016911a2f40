//! Shared harness: several grid members on one in-process transport

#![allow(dead_code)]

use partgrid_cluster::{
    ClusterTransport, GridConfig, GridConfigBuilder, GridEvent, LocalTransport, MemberId,
    MembershipEvent, PartitionedService, QuorumConfig, ServiceStatus,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

type ConfigTemplate = Box<dyn Fn(MemberId) -> GridConfigBuilder + Send + Sync>;

pub struct LocalCluster {
    pub transport: Arc<LocalTransport>,
    pub members: BTreeMap<MemberId, Arc<PartitionedService>>,
    template: ConfigTemplate,
}

impl LocalCluster {
    /// Start `count` members (ids 1..=count), each configured by `template`
    pub async fn start<F>(count: u32, template: F) -> Self
    where
        F: Fn(MemberId) -> GridConfigBuilder + Send + Sync + 'static,
    {
        let mut cluster = Self {
            transport: Arc::new(LocalTransport::default()),
            members: BTreeMap::new(),
            template: Box::new(template),
        };
        for id in 1..=count {
            cluster.add_member(id).await;
        }
        cluster
    }

    /// `count` members with `partitions` partitions and `backups` backups,
    /// distributing only once all of them joined
    pub async fn uniform(count: u32, partitions: u32, backups: usize) -> Self {
        Self::start(count, move |_| {
            GridConfig::builder()
                .partition_count(partitions)
                .backup_count(backups)
                .quorum(QuorumConfig::new(1, 1, count as usize))
        })
        .await
    }

    pub async fn add_member(&mut self, id: MemberId) -> Arc<PartitionedService> {
        let config = (self.template)(id).member_id(id).build();
        self.add_with_config(config).await
    }

    pub async fn add_with_config(&mut self, config: GridConfig) -> Arc<PartitionedService> {
        let id = config.member_id;
        let transport: Arc<dyn ClusterTransport> = self.transport.clone();
        let member = PartitionedService::start(config, transport)
            .await
            .expect("member starts");
        self.members.insert(id, member.clone());
        member
    }

    pub fn member(&self, id: MemberId) -> &Arc<PartitionedService> {
        &self.members[&id]
    }

    pub fn any(&self) -> &Arc<PartitionedService> {
        self.members.values().next().expect("cluster has members")
    }

    /// Crash a member: stop it silently, then let the failure detector
    /// report it
    pub fn kill(&mut self, id: MemberId) -> Arc<PartitionedService> {
        let member = self.members.remove(&id).expect("member exists");
        member.halt();
        self.transport
            .publish(MembershipEvent::Failed(id))
            .expect("failure published");
        member
    }

    /// Subscribe to the events of every current member
    pub fn subscribe_all(&self) -> Vec<broadcast::Receiver<GridEvent>> {
        self.members.values().map(|m| m.subscribe_events()).collect()
    }

    /// All members agree on the map, nothing is pending and the senior has
    /// nothing left to plan
    pub fn is_settled(&self) -> bool {
        let Some(first) = self.members.values().next() else {
            return true;
        };
        let version = first.map_version();
        let senior = first.view().senior();
        self.members.values().all(|m| {
            m.coordinator().is_idle()
                && m.map_version() == version
                && m.service_status() == ServiceStatus::Running
                && m.view().senior() == senior
        }) && senior
            .and_then(|s| self.members.get(&s))
            .map(|s| {
                let snapshot = s.map_snapshot();
                s.coordinator()
                    .placer()
                    .plan(&snapshot, &s.view().storage_members(), &HashSet::new())
                    .is_empty()
            })
            .unwrap_or(false)
    }

    /// Wait until the cluster stays settled for several consecutive polls
    pub async fn await_settled(&self) {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        let mut stable = 0;
        while stable < 5 {
            assert!(
                Instant::now() < deadline,
                "cluster did not settle: {:?}",
                self.members
                    .values()
                    .map(|m| m.health())
                    .collect::<Vec<_>>()
            );
            if self.is_settled() {
                stable += 1;
            } else {
                stable = 0;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn shutdown(self) {
        for member in self.members.values() {
            member.halt();
        }
    }
}

/// Drain every receiver, returning the events received so far
pub fn drain(receivers: &mut [broadcast::Receiver<GridEvent>]) -> Vec<GridEvent> {
    let mut events = Vec::new();
    for rx in receivers.iter_mut() {
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }
    events
}
