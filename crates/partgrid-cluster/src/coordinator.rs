//! Ownership coordinator - drives partition ownership from the senior
//!
//! Every member runs a coordinator, but only the senior's does any work.
//! It manages:
//! - Cluster recovery and the first distribution of an uninitialized map
//! - Repairs after departures (dropping dead backups, promoting backups)
//! - Orphaned partitions (persisted-copy recovery or data-loss declaration)
//! - Rebalancing through bounded-concurrency transfers
//!
//! All map changes are compare-and-set updates on the senior's map followed
//! by a broadcast of the whole map to every live member.

use crate::config::{GridConfig, TransferConfig};
use crate::error::{ClusterError, Result};
use crate::events::GridEvent;
use crate::member::MemberId;
use crate::membership::MembershipView;
use crate::observability::{GridMetrics, TransferMetrics};
use crate::partition::PartitionId;
use crate::partition_map::{OwnershipRole, PartitionOwnership, SharedPartitionMap};
use crate::persistence::StoredPartition;
use crate::placement::{DistributionStats, PartitionPlacer, PlannedTransfer, Repair};
use crate::protocol::{ClusterRequest, ClusterResponse};
use crate::quorum::{QuorumGate, QuorumPolicy};
use crate::retry::retry;
use crate::transfer::{TransferRole, TransferState, TransferTask};
use crate::transport::ClusterTransport;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Senior-side driver of ownership changes
pub struct OwnershipCoordinator {
    local: MemberId,
    partition_count: u32,
    transfer: TransferConfig,
    view: Arc<MembershipView>,
    map: Arc<SharedPartitionMap>,
    transport: Arc<dyn ClusterTransport>,
    placer: PartitionPlacer,
    quorum: QuorumPolicy,
    events: broadcast::Sender<GridEvent>,

    /// Wakes the rebalance loop
    kick: Notify,
    /// Kicks requested / kicks fully processed
    requested: AtomicU64,
    completed: AtomicU64,
    /// Whether this member already took over the senior role
    leading: AtomicBool,
    /// Last reported under-replicated partitions
    under_replicated: Mutex<Vec<PartitionId>>,
}

impl OwnershipCoordinator {
    pub fn new(
        config: &GridConfig,
        view: Arc<MembershipView>,
        map: Arc<SharedPartitionMap>,
        transport: Arc<dyn ClusterTransport>,
        events: broadcast::Sender<GridEvent>,
    ) -> Self {
        Self {
            local: config.member_id,
            partition_count: config.partitions.partition_count,
            transfer: config.transfer.clone(),
            view,
            map,
            transport,
            placer: PartitionPlacer::new(config.partitions.backup_count),
            quorum: QuorumPolicy::new(config.quorum.clone()),
            events,
            kick: Notify::new(),
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            leading: AtomicBool::new(false),
            under_replicated: Mutex::new(Vec::new()),
        }
    }

    /// Request a rebalance pass
    pub fn kick(&self) {
        self.requested.fetch_add(1, Ordering::SeqCst);
        self.kick.notify_one();
    }

    /// No kick is pending or being processed
    pub fn is_idle(&self) -> bool {
        self.completed.load(Ordering::SeqCst) >= self.requested.load(Ordering::SeqCst)
    }

    /// Whether this member currently acts as senior
    pub fn is_leading(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    pub fn placer(&self) -> &PartitionPlacer {
        &self.placer
    }

    /// Rebalance loop; runs until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.kick.notified() => {}
                _ = shutdown.recv() => {
                    debug!(member = self.local, "Coordinator loop stopped");
                    break;
                }
            }
            let generation = self.requested.load(Ordering::SeqCst);
            self.run_rounds().await;
            self.completed.fetch_max(generation, Ordering::SeqCst);
        }
    }

    async fn run_rounds(self: &Arc<Self>) {
        if !self.view.is_senior() {
            if self.leading.swap(false, Ordering::SeqCst) {
                info!(member = self.local, "Stepped down from senior role");
            }
            return;
        }

        let mut failures = 0;
        for _ in 0..self.transfer.max_rebalance_rounds {
            match self.rebalance().await {
                Ok(true) => failures = 0,
                Ok(false) => return,
                Err(ClusterError::NotSenior { .. }) | Err(ClusterError::SeniorUnavailable) => {
                    return
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.transfer.retry.delay_for_attempt(failures);
                    warn!(
                        member = self.local,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Rebalance round failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        warn!(
            member = self.local,
            rounds = self.transfer.max_rebalance_rounds,
            "Rebalance round limit reached"
        );
    }

    fn ensure_senior(&self) -> Result<()> {
        match self.view.senior() {
            Some(senior) if senior == self.local => Ok(()),
            Some(senior) => Err(ClusterError::NotSenior {
                senior: Some(senior),
            }),
            None => Err(ClusterError::SeniorUnavailable),
        }
    }

    /// One planning and execution round.
    ///
    /// Returns whether anything changed, in which case another round may
    /// find more to do.
    pub async fn rebalance(self: &Arc<Self>) -> Result<bool> {
        self.ensure_senior()?;
        GridMetrics::increment_rebalance_rounds();

        let live = self.view.storage_members();
        if !self.quorum.allows(QuorumGate::Service, live.len()) {
            info!(
                live = live.len(),
                required = self.quorum.threshold(QuorumGate::Service),
                "Below service quorum, not rebalancing"
            );
            return Ok(false);
        }

        if !self.leading.load(Ordering::SeqCst) {
            self.take_over().await?;
        }

        if !self.map.read().is_initialized() {
            if !self.quorum.allows(QuorumGate::Recovery, live.len()) {
                info!(
                    live = live.len(),
                    required = self.quorum.threshold(QuorumGate::Recovery),
                    "Waiting for recovery quorum"
                );
                return Ok(false);
            }
            self.recover_cluster(&live).await?;
            return Ok(true);
        }

        let snapshot = self.map.snapshot();
        let plan = self.placer.plan(&snapshot, &live, &HashSet::new());
        self.report_under_replicated(plan.under_replicated.clone());
        if plan.is_empty() {
            return Ok(false);
        }

        let mut changed = self.apply_repairs(&plan.repairs).await?;
        changed |= self.resolve_orphans(&plan.orphaned, &live).await?;
        if changed {
            self.publish_map().await;
        }

        let completed = self.execute(plan.transfers).await;
        Ok(changed || completed > 0)
    }

    /// Claim the senior role: adopt the newest map any member holds and
    /// reissue it at a fresh version so every member installs it.
    async fn take_over(&self) -> Result<()> {
        let peers: Vec<MemberId> = self
            .view
            .member_ids()
            .into_iter()
            .filter(|m| *m != self.local)
            .collect();

        let responses = join_all(
            peers
                .iter()
                .map(|peer| self.transport.send(self.local, *peer, ClusterRequest::FetchMap)),
        )
        .await;
        for (peer, response) in peers.iter().zip(responses) {
            match response.and_then(|r| r.into_result()) {
                Ok(ClusterResponse::Map(snapshot)) => {
                    if self.map.install(snapshot) {
                        debug!(peer, version = self.map.version(), "Adopted newer map from peer");
                    }
                }
                Ok(other) => warn!(peer, response = ?other, "Unexpected FetchMap response"),
                Err(e) => warn!(peer, error = %e, "Failed to fetch map from peer"),
            }
        }

        self.ensure_senior()?;
        if self.map.read().is_initialized() {
            self.map.bump();
            self.publish_map().await;
        }
        self.leading.store(true, Ordering::SeqCst);
        info!(
            member = self.local,
            version = self.map.version(),
            "Assumed senior role"
        );
        Ok(())
    }

    /// Compare-and-set one map entry, re-reading it on conflict
    async fn update<F>(&self, partition: PartitionId, mut change: F) -> Result<u64>
    where
        F: FnMut(&SharedPartitionMap, &PartitionOwnership) -> Result<u64>,
    {
        let map: &SharedPartitionMap = &self.map;
        retry(&self.transfer.retry, |_| {
            let result = map
                .lookup(partition)
                .and_then(|entry| change(map, &entry));
            if matches!(result, Err(ClusterError::Conflict { .. })) {
                GridMetrics::increment_map_conflicts();
            }
            std::future::ready(result)
        })
        .await
    }

    /// Send the local map to every other live member
    pub async fn publish_map(&self) {
        let snapshot = self.map.snapshot();
        let version = snapshot.version;
        GridMetrics::set_map_version(version);

        let targets: Vec<MemberId> = self
            .view
            .member_ids()
            .into_iter()
            .filter(|m| *m != self.local)
            .collect();
        let responses = join_all(targets.iter().map(|target| {
            self.transport.send(
                self.local,
                *target,
                ClusterRequest::MapUpdate {
                    snapshot: snapshot.clone(),
                },
            )
        }))
        .await;

        for (target, response) in targets.iter().zip(responses) {
            if let Err(e) = response.and_then(|r| r.into_result()) {
                warn!(member = target, version, error = %e, "Failed to publish map");
            }
        }
        debug!(version, members = targets.len(), "Published partition map");
    }

    /// Collect persisted partition copies from `members`
    async fn gather_persisted(&self, members: &[MemberId]) -> Vec<(MemberId, Vec<StoredPartition>)> {
        let responses = join_all(members.iter().map(|member| {
            self.transport
                .send(self.local, *member, ClusterRequest::ReportPersisted)
        }))
        .await;

        let mut reports = Vec::new();
        for (member, response) in members.iter().zip(responses) {
            match response.and_then(|r| r.into_result()) {
                Ok(ClusterResponse::Persisted(stored)) => reports.push((*member, stored)),
                Ok(other) => warn!(member, response = ?other, "Unexpected ReportPersisted response"),
                Err(e) => warn!(member, error = %e, "Failed to collect persisted partitions"),
            }
        }
        reports
    }

    /// Highest LSN copy per partition, ties to the lowest member id
    fn best_copies(reports: &[(MemberId, Vec<StoredPartition>)]) -> BTreeMap<PartitionId, (u64, MemberId)> {
        let mut best: BTreeMap<PartitionId, (u64, MemberId)> = BTreeMap::new();
        for (member, stored) in reports {
            for copy in stored {
                let better = match best.get(&copy.partition) {
                    None => true,
                    Some((lsn, holder)) => {
                        copy.lsn > *lsn || (copy.lsn == *lsn && member < holder)
                    }
                };
                if better {
                    best.insert(copy.partition, (copy.lsn, *member));
                }
            }
        }
        best
    }

    async fn send_batches(
        &self,
        batches: BTreeMap<MemberId, Vec<PartitionId>>,
        request: impl Fn(Vec<PartitionId>) -> ClusterRequest,
    ) -> Result<()> {
        let members: Vec<MemberId> = batches.keys().copied().collect();
        let responses = join_all(
            batches
                .into_iter()
                .map(|(member, partitions)| {
                    self.transport
                        .send(self.local, member, request(partitions))
                }),
        )
        .await;
        for (member, response) in members.into_iter().zip(responses) {
            response.and_then(|r| r.into_result()).map_err(|e| {
                warn!(member, error = %e, "Partition setup request failed");
                e
            })?;
        }
        Ok(())
    }

    /// Build the first map of the cluster.
    ///
    /// When no live member holds a persisted partition, partitions are
    /// distributed round-robin. Otherwise each partition goes to the member
    /// with the highest persisted LSN; partitions nobody reports stay orphaned
    /// and go through the data-loss path in the next round.
    pub async fn recover_cluster(&self, live: &[MemberId]) -> Result<()> {
        self.ensure_senior()?;
        self.quorum.check(QuorumGate::Recovery, live.len())?;

        let reports = self.gather_persisted(live).await;
        let best = Self::best_copies(&reports);

        if best.is_empty() {
            let assignments = self.placer.initial_distribution(live, self.partition_count);
            let mut batches: BTreeMap<MemberId, Vec<PartitionId>> = BTreeMap::new();
            for (p, entry) in assignments.iter().enumerate() {
                for owner in entry.owners() {
                    batches.entry(owner).or_default().push(p as PartitionId);
                }
            }
            self.send_batches(batches, |partitions| ClusterRequest::InitPartitions {
                partitions,
            })
            .await?;

            let version = self.map.initialize(assignments, BTreeSet::new())?;
            info!(
                version,
                members = live.len(),
                partitions = self.partition_count,
                "Initial partition distribution installed"
            );
        } else {
            let mut batches: BTreeMap<MemberId, Vec<PartitionId>> = BTreeMap::new();
            for (partition, (_, member)) in &best {
                batches.entry(*member).or_default().push(*partition);
            }
            self.send_batches(batches, |partitions| ClusterRequest::RecoverPartitions {
                partitions,
            })
            .await?;

            let assignments = (0..self.partition_count)
                .map(|p| PartitionOwnership::new(best.get(&p).map(|(_, m)| *m), Vec::new()))
                .collect();
            let version = self.map.initialize(assignments, BTreeSet::new())?;
            info!(
                version,
                recovered = best.len(),
                missing = self.partition_count as usize - best.len(),
                "Partition map recovered from persisted copies"
            );
            for (partition, (lsn, member)) in best {
                let _ = self.events.send(GridEvent::PartitionRecovered {
                    partition,
                    member,
                    lsn,
                });
            }
        }

        self.publish_map().await;
        Ok(())
    }

    async fn apply_repairs(&self, repairs: &[Repair]) -> Result<bool> {
        for repair in repairs {
            let partition = repair.partition();
            match *repair {
                Repair::DropBackup { member, .. } => {
                    self.update(partition, |map, entry| {
                        match entry.backups.iter().position(|b| *b == member) {
                            Some(index) => map.assign(
                                partition,
                                OwnershipRole::Backup(index),
                                None,
                                entry.version,
                            ),
                            None => Ok(map.version()),
                        }
                    })
                    .await?;
                    debug!(partition, member, "Dropped departed backup");
                }
                Repair::Promote { member, .. } => {
                    self.update(partition, |map, entry| {
                        map.promote(partition, member, false, entry.version)
                    })
                    .await?;
                    info!(partition, member, "Promoted backup to primary");
                    let _ = self
                        .events
                        .send(GridEvent::PrimaryPromoted { partition, member });
                }
                Repair::Orphan { .. } => {
                    self.update(partition, |map, entry| {
                        map.assign(partition, OwnershipRole::Primary, None, entry.version)
                    })
                    .await?;
                    warn!(partition, "Partition orphaned: no live copy");
                }
            }
        }
        Ok(!repairs.is_empty())
    }

    /// Restore orphaned partitions from persisted copies, or declare them
    /// lost once the loss quorum allows it.
    async fn resolve_orphans(&self, orphaned: &[PartitionId], live: &[MemberId]) -> Result<bool> {
        if orphaned.is_empty() {
            return Ok(false);
        }

        let reports = self.gather_persisted(live).await;
        let best = Self::best_copies(&reports);
        let mut changed = false;

        let mut recoverable: BTreeMap<MemberId, Vec<PartitionId>> = BTreeMap::new();
        for partition in orphaned {
            if let Some((_, member)) = best.get(partition) {
                recoverable.entry(*member).or_default().push(*partition);
            }
        }

        for (member, partitions) in recoverable {
            let response = self
                .transport
                .send(
                    self.local,
                    member,
                    ClusterRequest::RecoverPartitions {
                        partitions: partitions.clone(),
                    },
                )
                .await
                .and_then(|r| r.into_result());
            if let Err(e) = response {
                warn!(member, error = %e, "Persisted recovery request failed");
                continue;
            }
            for partition in partitions {
                self.update(partition, |map, entry| {
                    map.assign(partition, OwnershipRole::Primary, Some(member), entry.version)
                })
                .await?;
                let lsn = best.get(&partition).map(|(lsn, _)| *lsn).unwrap_or(0);
                info!(partition, member, lsn, "Orphaned partition restored from persisted copy");
                let _ = self.events.send(GridEvent::PartitionRecovered {
                    partition,
                    member,
                    lsn,
                });
                changed = true;
            }
        }

        let unrecoverable: Vec<PartitionId> = orphaned
            .iter()
            .copied()
            .filter(|p| !best.contains_key(p))
            .collect();
        if unrecoverable.is_empty() {
            return Ok(changed);
        }
        if !self.quorum.allows(QuorumGate::LossAcknowledgement, live.len()) {
            warn!(
                partitions = unrecoverable.len(),
                live = live.len(),
                required = self.quorum.threshold(QuorumGate::LossAcknowledgement),
                "Orphaned partitions pending: below loss quorum"
            );
            return Ok(changed);
        }

        for partition in unrecoverable {
            self.update(partition, |map, entry| map.mark_lost(partition, entry.version))
                .await?;
            warn!(partition, "Data loss: no surviving copy of partition");
            GridMetrics::increment_data_loss();
            let _ = self.events.send(GridEvent::DataLoss { partition });
            changed = true;
        }
        Ok(changed)
    }

    fn report_under_replicated(&self, partitions: Vec<PartitionId>) {
        let mut last = self.under_replicated.lock();
        if *last == partitions {
            return;
        }
        GridMetrics::set_under_replicated_partitions(partitions.len());
        if !partitions.is_empty() {
            warn!(
                partitions = partitions.len(),
                "Partitions below the configured backup count"
            );
        }
        *last = partitions.clone();
        let _ = self.events.send(GridEvent::UnderReplicated { partitions });
    }

    /// Run planned transfers with bounded concurrency; returns how many
    /// completed
    async fn execute(self: &Arc<Self>, transfers: Vec<PlannedTransfer>) -> usize {
        if transfers.is_empty() {
            return 0;
        }
        let semaphore = Arc::new(Semaphore::new(self.transfer.max_concurrent_transfers));
        let mut running = JoinSet::new();

        for planned in transfers {
            let coordinator = self.clone();
            let semaphore = semaphore.clone();
            running.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ClusterError::ShuttingDown)?;
                coordinator.run_transfer(planned).await
            });
        }

        let mut completed = 0;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(())) => completed += 1,
                Ok(Err(e)) => debug!(error = %e, "Transfer did not complete"),
                Err(e) => error!(error = %e, "Transfer task panicked"),
            }
        }
        completed
    }

    /// Execute one transfer end to end, aborting it on any failure
    pub async fn run_transfer(&self, planned: PlannedTransfer) -> Result<()> {
        let mut task = TransferTask::new(
            planned.partition,
            planned.source,
            planned.destination,
            planned.role,
            planned.replaces,
        );
        TransferMetrics::increment_started();
        let started = Instant::now();
        info!(
            task = %task.id,
            partition = task.partition,
            source = task.source,
            destination = task.destination,
            role = ?task.role,
            "Transfer scheduled"
        );

        match self.drive(&mut task).await {
            Ok(()) => {
                TransferMetrics::increment_completed();
                TransferMetrics::record_duration(started.elapsed());
                info!(task = %task.id, partition = task.partition, "Transfer complete");
                let _ = self.events.send(GridEvent::TransferCompleted {
                    task: task.id,
                    partition: task.partition,
                    role: task.role,
                    source: task.source,
                    destination: task.destination,
                });
                Ok(())
            }
            Err(e) => {
                let committed = task.map_committed();
                if task.abort() {
                    TransferMetrics::increment_aborted();
                }
                self.notify_abort(&task).await;
                warn!(
                    task = %task.id,
                    partition = task.partition,
                    map_committed = committed,
                    error = %e,
                    "Transfer aborted"
                );
                let reason = e.to_string();
                let _ = self.events.send(GridEvent::TransferAborted {
                    task: task.id,
                    partition: task.partition,
                    reason: reason.clone(),
                });
                Err(ClusterError::TransferAborted {
                    task: task.id,
                    reason,
                })
            }
        }
    }

    async fn request(&self, to: MemberId, request: ClusterRequest) -> Result<ClusterResponse> {
        self.transport
            .send(self.local, to, request)
            .await?
            .into_result()
    }

    async fn drive(&self, task: &mut TransferTask) -> Result<()> {
        self.ensure_senior()?;
        let partition = task.partition;

        task.advance(TransferState::DataRequested)?;
        let bulk = match self
            .request(task.source, ClusterRequest::BeginTransfer { task: task.clone() })
            .await?
        {
            ClusterResponse::Bulk(snapshot) => snapshot,
            other => return Err(ClusterError::UnexpectedResponse(format!("{:?}", other))),
        };
        TransferMetrics::record_bulk_entries(bulk.len());
        self.request(
            task.destination,
            ClusterRequest::ReceiveBulk {
                task: task.clone(),
                snapshot: bulk,
            },
        )
        .await?;

        task.advance(TransferState::DataSent)?;
        let delta = match self
            .request(
                task.source,
                ClusterRequest::SealTransfer {
                    task: task.id,
                    partition,
                },
            )
            .await?
        {
            ClusterResponse::Delta(delta) => delta,
            other => return Err(ClusterError::UnexpectedResponse(format!("{:?}", other))),
        };
        debug!(task = %task.id, partition, delta = delta.len(), "Forwarding captured writes");
        self.request(
            task.destination,
            ClusterRequest::ReceiveDelta {
                task: task.id,
                partition,
                delta,
            },
        )
        .await?;
        task.advance(TransferState::DataAcknowledged)?;

        self.ensure_senior()?;
        let version = self.commit(task).await?;
        self.publish_map().await;
        task.advance(TransferState::MapUpdated)?;
        debug!(task = %task.id, partition, version, "Transfer committed to map");

        for member in [task.source, task.destination] {
            if let Err(e) = self
                .request(
                    member,
                    ClusterRequest::CompleteTransfer {
                        task: task.id,
                        partition,
                    },
                )
                .await
            {
                warn!(task = %task.id, member, error = %e, "Failed to complete transfer");
            }
        }
        task.advance(TransferState::Complete)?;
        Ok(())
    }

    /// Record the destination in the map
    async fn commit(&self, task: &TransferTask) -> Result<u64> {
        let partition = task.partition;
        self.update(partition, |map, entry| {
            if entry.primary != Some(task.source) {
                return Err(ClusterError::InvalidAssignment {
                    partition,
                    reason: format!("source {} is no longer primary", task.source),
                });
            }
            match task.role {
                TransferRole::Primary => {
                    let swap = entry.backups.contains(&task.destination);
                    map.promote(partition, task.destination, swap, entry.version)
                }
                TransferRole::Backup => {
                    if entry.holds(task.destination) {
                        return Err(ClusterError::DuplicateOwner {
                            partition,
                            member: task.destination,
                        });
                    }
                    let index = task
                        .replaces
                        .and_then(|r| entry.backups.iter().position(|b| *b == r))
                        .unwrap_or(entry.backups.len());
                    map.assign(
                        partition,
                        OwnershipRole::Backup(index),
                        Some(task.destination),
                        entry.version,
                    )
                }
            }
        })
        .await
    }

    async fn notify_abort(&self, task: &TransferTask) {
        for member in [task.source, task.destination] {
            let request = ClusterRequest::AbortTransfer {
                task: task.id,
                partition: task.partition,
            };
            if let Err(e) = self.request(member, request).await {
                debug!(task = %task.id, member, error = %e, "Abort notification failed");
            }
        }
    }

    /// Give every lost partition an empty primary again.
    ///
    /// Operator action; the partitions' previous contents are gone.
    pub async fn recreate_lost_partitions(&self) -> Result<Vec<PartitionId>> {
        self.ensure_senior()?;
        let live = self.view.storage_members();
        self.quorum.check(QuorumGate::Service, live.len())?;
        if live.is_empty() {
            return Err(ClusterError::ServiceSuspended {
                required: self.quorum.threshold(QuorumGate::Service),
                live: 0,
            });
        }

        let lost: Vec<PartitionId> = self.map.read().lost().iter().copied().collect();
        let mut loads: HashMap<MemberId, usize> = self.map.snapshot().primary_counts();
        let mut recreated = Vec::new();

        for partition in lost {
            let Some(member) = live
                .iter()
                .copied()
                .min_by_key(|m| (loads.get(m).copied().unwrap_or(0), *m))
            else {
                break;
            };
            self.request(member, ClusterRequest::CreatePartition { partition })
                .await?;
            self.update(partition, |map, entry| {
                map.assign(partition, OwnershipRole::Primary, Some(member), entry.version)
            })
            .await?;
            *loads.entry(member).or_insert(0) += 1;
            info!(partition, member, "Lost partition recreated empty");
            let _ = self
                .events
                .send(GridEvent::PartitionRecreated { partition, member });
            recreated.push(partition);
        }

        if !recreated.is_empty() {
            self.publish_map().await;
            self.kick();
        }
        Ok(recreated)
    }

    /// Distribution over the live storage members
    pub fn distribution_stats(&self) -> DistributionStats {
        self.placer
            .stats(&self.map.snapshot(), &self.view.storage_members())
    }
}
