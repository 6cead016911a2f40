//! Partitioned service - one grid member
//!
//! [`PartitionedService`] wires the membership view, partition map, local
//! partition store, replication, persistence and the ownership coordinator
//! together and exposes the routed key/value API.
//!
//! ```rust,ignore
//! use partgrid_cluster::{GridConfig, LocalTransport, PartitionedService};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(LocalTransport::default());
//! let member = PartitionedService::start(GridConfig::single(1), transport).await?;
//! member.put(b"key".to_vec(), b"value".to_vec()).await?;
//! assert_eq!(member.get(b"key").await?, Some(b"value".to_vec()));
//! ```

use crate::config::{GridConfig, PersistenceMode};
use crate::coordinator::OwnershipCoordinator;
use crate::error::{ClusterError, Result};
use crate::events::GridEvent;
use crate::member::{MemberId, MemberInfo};
use crate::membership::{MembershipEvent, MembershipView, ViewChange};
use crate::observability::GridMetrics;
use crate::partition::{
    partition_for_key, Mutation, PartitionData, PartitionId, PartitionSnapshot, ReplicaApply,
    SequencedMutation,
};
use crate::partition_map::{MapSnapshot, SharedPartitionMap};
use crate::persistence::{PersistenceBackend, PersistenceCoordinator, SnapshotId};
use crate::placement::DistributionStats;
use crate::protocol::{ClusterRequest, ClusterResponse, WireError};
use crate::quorum::{QuorumGate, QuorumPolicy, ServiceStatus};
use crate::replication::ReplicationManager;
use crate::store::{LocalPartition, LocalStore, PartitionSlot};
use crate::transfer::{IncomingTransfer, OutgoingTransfer, TransferId, TransferTask};
use crate::transport::{ClusterTransport, RequestHandler};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// One member of the data grid
pub struct PartitionedService {
    config: GridConfig,
    local: MemberId,
    view: Arc<MembershipView>,
    map: Arc<SharedPartitionMap>,
    store: Arc<LocalStore>,
    persistence: PersistenceCoordinator,
    replication: Arc<ReplicationManager>,
    coordinator: Arc<OwnershipCoordinator>,
    transport: Arc<dyn ClusterTransport>,
    quorum: QuorumPolicy,
    events: broadcast::Sender<GridEvent>,
    status: Mutex<ServiceStatus>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PartitionedService {
    /// Start a member with the persistence backend named in `config`
    pub async fn start(
        config: GridConfig,
        transport: Arc<dyn ClusterTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let persistence = PersistenceCoordinator::open(&config.persistence)?;
        Self::launch(config, transport, persistence).await
    }

    /// Start a member with an injected persistence backend
    pub async fn start_with_backend(
        config: GridConfig,
        transport: Arc<dyn ClusterTransport>,
        backend: Arc<dyn PersistenceBackend>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let persistence = PersistenceCoordinator::with_backend(config.persistence.mode, backend);
        Self::launch(config, transport, persistence).await
    }

    async fn launch(
        config: GridConfig,
        transport: Arc<dyn ClusterTransport>,
        persistence: PersistenceCoordinator,
    ) -> Result<Arc<Self>> {
        let local = config.member_id;
        let view = Arc::new(MembershipView::new(local, config.membership.clone()));
        let map = Arc::new(SharedPartitionMap::new(config.partitions.partition_count));
        let store = Arc::new(LocalStore::new());
        let (events, _) = broadcast::channel(config.membership.event_buffer.max(16));
        let (shutdown_tx, _) = broadcast::channel(1);

        let replication = Arc::new(ReplicationManager::new(
            local,
            config.replication.clone(),
            transport.clone(),
            view.clone(),
            store.clone(),
        ));
        let coordinator = Arc::new(OwnershipCoordinator::new(
            &config,
            view.clone(),
            map.clone(),
            transport.clone(),
            events.clone(),
        ));
        let quorum = QuorumPolicy::new(config.quorum.clone());

        let service = Arc::new(Self {
            config,
            local,
            view,
            map,
            store,
            persistence,
            replication,
            coordinator,
            transport,
            quorum,
            events,
            status: Mutex::new(ServiceStatus::Suspended),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let view_changes = service.view.subscribe();
        let map_versions = service.map.subscribe();
        service.transport.attach(
            local,
            Arc::new(ServiceHandler {
                service: Arc::downgrade(&service),
            }),
            service.view.clone(),
        )?;
        service.spawn_tasks(view_changes, map_versions);

        let mut info = MemberInfo::new(local).with_role(service.config.role);
        if let Some(name) = &service.config.member_name {
            info = info.with_name(name.clone());
        }
        service.transport.publish(MembershipEvent::Joined(info))?;
        service.sync_map().await;

        info!(
            member = local,
            role = ?service.config.role,
            partitions = service.config.partitions.partition_count,
            persistence = ?service.persistence.mode(),
            "Grid member started"
        );
        Ok(service)
    }

    fn spawn_tasks(
        self: &Arc<Self>,
        mut view_changes: broadcast::Receiver<ViewChange>,
        mut map_versions: watch::Receiver<u64>,
    ) {
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(
            self.coordinator
                .clone()
                .run(self.shutdown_tx.subscribe()),
        ));

        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    change = view_changes.recv() => change,
                    _ = shutdown.recv() => break,
                };
                let Some(service) = weak.upgrade() else { break };
                match change {
                    Ok(change) => service.on_view_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Membership changes lagged");
                        service.coordinator.kick();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = map_versions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
                let version = *map_versions.borrow_and_update();
                let Some(service) = weak.upgrade() else { break };
                service.on_map_installed(version).await;
            }
        }));

        if let (PersistenceMode::OnDemand, Some(interval)) = (
            self.persistence.mode(),
            self.config.persistence.snapshot_interval,
        ) {
            let weak = Arc::downgrade(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.recv() => break,
                    }
                    let Some(service) = weak.upgrade() else { break };
                    if let Err(e) = service.snapshot_all().await {
                        warn!(error = %e, "Periodic snapshot failed");
                    }
                }
            }));
        }
    }

    /// Fetch the map from the senior after joining
    async fn sync_map(&self) {
        let Some(senior) = self.view.senior() else { return };
        if senior == self.local {
            return;
        }
        match self
            .transport
            .send(self.local, senior, ClusterRequest::FetchMap)
            .await
            .and_then(|r| r.into_result())
        {
            Ok(ClusterResponse::Map(snapshot)) => {
                self.map.install(snapshot);
            }
            Ok(other) => warn!(senior, response = ?other, "Unexpected FetchMap response"),
            Err(e) => warn!(senior, error = %e, "Failed to fetch map from senior"),
        }
    }

    // ==================== Background reactions ====================

    async fn on_view_change(&self, change: ViewChange) {
        match change {
            ViewChange::MemberJoined(member) => {
                debug!(member = member.id(), "Member joined view");
            }
            ViewChange::MemberDeparted { member, failed } => {
                if failed {
                    warn!(member, "Member failed");
                } else {
                    info!(member, "Member left");
                }
                self.clear_transfers(Some(member)).await;
            }
            ViewChange::SeniorChanged { previous, current } => {
                info!(?previous, ?current, "Senior changed");
                // transfers of the previous senior can no longer complete
                self.clear_transfers(None).await;
                let _ = self
                    .events
                    .send(GridEvent::SeniorChanged { previous, current });
            }
        }
        GridMetrics::set_member_count(self.view.live_count());
        GridMetrics::set_storage_member_count(self.view.storage_count());
        self.refresh_status();
        self.coordinator.kick();
    }

    async fn on_map_installed(&self, version: u64) {
        GridMetrics::set_map_version(version);
        self.release_unowned().await;
        self.refresh_status();
        let _ = self.events.send(GridEvent::MapInstalled { version });
    }

    /// Drop local copies the map no longer assigns to this member
    async fn release_unowned(&self) {
        if !self.map.read().is_initialized() {
            return;
        }
        for partition in self.store.partitions() {
            if !self.is_primary(partition) {
                self.replication.release(partition);
            }
            if self.owns(partition) {
                continue;
            }
            let Some(slot) = self.store.get(partition) else { continue };
            let local = slot.lock().await;
            if local.incoming.is_none() && !self.owns(partition) {
                drop(local);
                self.store.remove(partition);
                debug!(partition, "Released partition copy");
            }
        }
    }

    /// Discard transfer state involving `member`, or all of it
    async fn clear_transfers(&self, member: Option<MemberId>) {
        for partition in self.store.partitions() {
            let Some(slot) = self.store.get(partition) else { continue };
            let mut local = slot.lock().await;
            let cleared = match member {
                Some(member) => local.clear_transfers_with(member),
                None => {
                    let active = local.incoming.is_some() || local.outgoing.is_some();
                    local.incoming = None;
                    local.outgoing = None;
                    active
                }
            };
            if !cleared {
                continue;
            }
            debug!(partition, "Cleared transfer state");
            if local.incoming.is_none() && !self.owns(partition) {
                drop(local);
                self.store.remove(partition);
            }
        }
    }

    fn refresh_status(&self) {
        let current = self.service_status();
        let mut status = self.status.lock();
        if *status != current {
            let previous = std::mem::replace(&mut *status, current);
            info!(
                previous = previous.as_str(),
                current = current.as_str(),
                "Service status changed"
            );
            let _ = self
                .events
                .send(GridEvent::StatusChanged { previous, current });
        }
    }

    fn owns(&self, partition: PartitionId) -> bool {
        self.map
            .read()
            .lookup(partition)
            .map(|entry| entry.holds(self.local))
            .unwrap_or(false)
    }

    fn is_primary(&self, partition: PartitionId) -> bool {
        self.map.read().primary(partition) == Some(self.local)
    }

    // ==================== Client API ====================

    pub fn member_id(&self) -> MemberId {
        self.local
    }

    pub fn partition_count(&self) -> u32 {
        self.config.partitions.partition_count
    }

    /// Partition a key belongs to
    pub fn partition_for(&self, key: &[u8]) -> PartitionId {
        partition_for_key(key, self.config.partitions.partition_count)
    }

    /// Current primary of the partition a key belongs to
    pub fn route(&self, key: &[u8]) -> Result<MemberId> {
        let partition = self.partition_for(key);
        let map = self.map.read();
        if map.is_lost(partition) {
            return Err(ClusterError::DataLoss { partition });
        }
        map.lookup(partition)?
            .primary
            .ok_or(ClusterError::PartitionOrphaned { partition })
    }

    /// Store a value; returns the previous value
    pub async fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        let key = key.into();
        let partition = self.partition_for(&key);
        self.invoke(
            partition,
            ClusterRequest::Put {
                partition,
                key,
                value: value.into(),
            },
        )
        .await
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let partition = self.partition_for(key);
        self.invoke(
            partition,
            ClusterRequest::Get {
                partition,
                key: key.to_vec(),
            },
        )
        .await
    }

    /// Remove a key; returns the removed value
    pub async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let partition = self.partition_for(key);
        self.invoke(
            partition,
            ClusterRequest::Remove {
                partition,
                key: key.to_vec(),
            },
        )
        .await
    }

    /// Send a data request to the partition's primary, following redirects.
    ///
    /// `ServiceSuspended` and `DataLoss` are returned immediately; other
    /// retriable conditions are retried with backoff until the client retry
    /// budget runs out. A put or remove that failed after it may already
    /// have been applied (timeout, unacknowledged backup) is not resent,
    /// since a second attempt would report the wrong previous value.
    async fn invoke(
        &self,
        partition: PartitionId,
        request: ClusterRequest,
    ) -> Result<Option<Vec<u8>>> {
        let retry = &self.config.client_retry;
        let mut hint: Option<MemberId> = None;
        let mut attempt: u32 = 0;

        loop {
            let result = match self.check_service(partition) {
                Ok(()) => {
                    let target = match hint.take() {
                        Some(member) => Ok(member),
                        None => self.lookup_primary(partition),
                    };
                    match target {
                        Ok(member) => self
                            .transport
                            .send(self.local, member, request.clone())
                            .await
                            .and_then(|r| r.into_result()),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };

            let e = match result {
                Ok(ClusterResponse::Value(value)) => return Ok(value),
                Ok(other) => {
                    return Err(ClusterError::UnexpectedResponse(format!("{:?}", other)))
                }
                Err(e) => e,
            };
            if e.is_surfaced() || !e.is_retriable() {
                return Err(e);
            }
            if request.is_mutation() && e.is_indeterminate() {
                debug!(partition, error = %e, "Write outcome unknown, not resending");
                return Err(e);
            }
            if attempt >= retry.max_retries {
                return Err(ClusterError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(e),
                });
            }

            attempt += 1;
            match e.redirect_target() {
                Some(owner) => {
                    GridMetrics::increment_redirects();
                    trace!(partition, owner, attempt, "Following redirect");
                    hint = Some(owner);
                }
                None => {
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(partition, attempt, error = %e, "Retrying routed request");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn lookup_primary(&self, partition: PartitionId) -> Result<MemberId> {
        let map = self.map.read();
        if map.is_lost(partition) {
            return Err(ClusterError::DataLoss { partition });
        }
        map.lookup(partition)?
            .primary
            .ok_or(ClusterError::PartitionOrphaned { partition })
    }

    /// Refuse requests while below service quorum or before the map exists
    fn check_service(&self, partition: PartitionId) -> Result<()> {
        if let Err(e) = self
            .quorum
            .check(QuorumGate::Service, self.view.storage_count())
        {
            GridMetrics::increment_suspended_requests();
            return Err(e);
        }
        if !self.map.read().is_initialized() {
            return Err(ClusterError::PartitionOrphaned { partition });
        }
        Ok(())
    }

    /// Suspended below service quorum, recovering until the map is
    /// initialized, running otherwise
    pub fn service_status(&self) -> ServiceStatus {
        self.quorum.status(
            self.view.storage_count(),
            self.map.read().is_initialized(),
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GridEvent> {
        self.events.subscribe()
    }

    pub fn map_snapshot(&self) -> MapSnapshot {
        self.map.snapshot()
    }

    pub fn map_version(&self) -> u64 {
        self.map.version()
    }

    pub fn view(&self) -> &Arc<MembershipView> {
        &self.view
    }

    pub fn coordinator(&self) -> &Arc<OwnershipCoordinator> {
        &self.coordinator
    }

    pub fn persistence(&self) -> &PersistenceCoordinator {
        &self.persistence
    }

    /// Partitions held locally, in any role
    pub fn local_partitions(&self) -> Vec<PartitionId> {
        self.store.partitions()
    }

    /// Entry count and sequence of a locally held partition
    pub async fn local_state(&self, partition: PartitionId) -> Option<(usize, u64)> {
        let slot = self.store.get(partition)?;
        let local = slot.lock().await;
        Some((local.data.len(), local.data.seq()))
    }

    pub fn distribution_stats(&self) -> DistributionStats {
        self.coordinator.distribution_stats()
    }

    pub fn health(&self) -> GridHealth {
        let snapshot = self.map.snapshot();
        let storage = self.view.storage_count();
        let target = self
            .coordinator
            .placer()
            .effective_backups(storage);
        let under_replicated = snapshot
            .partitions
            .iter()
            .filter(|e| e.primary.is_some() && e.backups.len() < target)
            .count();
        let orphaned = snapshot
            .partitions
            .iter()
            .enumerate()
            .filter(|(p, e)| {
                e.primary.is_none() && !snapshot.lost.contains(&(*p as PartitionId))
            })
            .count();

        GridHealth {
            service_status: self.service_status(),
            member: self.local,
            senior: self.view.senior(),
            live_members: self.view.live_count(),
            storage_members: storage,
            map_version: snapshot.version,
            partition_count: snapshot.partition_count(),
            owned_primaries: snapshot
                .partitions
                .iter()
                .filter(|e| e.primary == Some(self.local))
                .count(),
            owned_backups: snapshot
                .partitions
                .iter()
                .filter(|e| e.backups.contains(&self.local))
                .count(),
            orphaned_partitions: orphaned,
            lost_partitions: snapshot.lost.len(),
            under_replicated_partitions: under_replicated,
        }
    }

    // ==================== Persistence ====================

    /// Write a snapshot of one locally held partition
    pub async fn snapshot_partition(&self, partition: PartitionId) -> Result<SnapshotId> {
        let slot = self
            .store
            .get(partition)
            .ok_or(ClusterError::PartitionNotFound(partition))?;
        let snapshot = slot.lock().await.data.snapshot(partition);
        self.persistence.snapshot(&snapshot)
    }

    /// Snapshot every locally owned partition; returns how many were written
    pub async fn snapshot_all(&self) -> Result<usize> {
        if !self.persistence.is_enabled() {
            return Err(ClusterError::PersistenceDisabled);
        }
        let mut written = 0;
        for partition in self.store.partitions() {
            if !self.owns(partition) {
                continue;
            }
            self.snapshot_partition(partition).await?;
            written += 1;
        }
        info!(partitions = written, "Snapshot of owned partitions written");
        Ok(written)
    }

    // ==================== Ownership actions ====================

    /// Promote the first live backup of a partition whose primary departed.
    ///
    /// Failure-observer fallback for when the senior is slow to react. The
    /// change is a compare-and-set on the local map, broadcast to every
    /// member; receivers keep whichever version is newer.
    pub async fn emergency_promote(&self, partition: PartitionId) -> Result<u64> {
        self.quorum
            .check(QuorumGate::Service, self.view.storage_count())?;
        let entry = self.map.lookup(partition)?;
        if let Some(primary) = entry.primary {
            if self.view.contains(primary) {
                return Err(ClusterError::InvalidAssignment {
                    partition,
                    reason: format!("primary {} is alive", primary),
                });
            }
        }
        let candidate = entry
            .backups
            .iter()
            .copied()
            .find(|b| self.view.contains(*b))
            .ok_or(ClusterError::PartitionOrphaned { partition })?;

        let version = self
            .map
            .promote(partition, candidate, false, entry.version)?;
        warn!(
            partition,
            member = candidate,
            version,
            "Emergency promotion of backup"
        );
        let _ = self.events.send(GridEvent::PrimaryPromoted {
            partition,
            member: candidate,
        });
        self.coordinator.publish_map().await;
        Ok(version)
    }

    /// Assign empty primaries to lost partitions (senior only)
    pub async fn recreate_lost_partitions(&self) -> Result<Vec<PartitionId>> {
        self.coordinator.recreate_lost_partitions().await
    }

    // ==================== Lifecycle ====================

    /// Leave the grid gracefully: snapshot owned partitions (on-demand
    /// persistence), announce the departure, then stop
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.persistence.mode() == PersistenceMode::OnDemand {
            if let Err(e) = self.snapshot_all().await {
                warn!(error = %e, "Snapshot before shutdown failed");
            }
        }
        self.transport
            .publish(MembershipEvent::Left(self.local))?;
        self.halt();
        info!(member = self.local, "Grid member shut down");
        Ok(())
    }

    /// Stop all local activity and detach without announcing anything
    pub fn halt(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.replication.shutdown();
        self.transport.detach(self.local);
        self.persistence.close();
        debug!(member = self.local, "Grid member halted");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ==================== Request handling ====================

    async fn dispatch(&self, source: MemberId, request: ClusterRequest) -> Result<ClusterResponse> {
        if self.is_stopped() {
            return Err(ClusterError::ShuttingDown);
        }
        trace!(source, kind = request.kind(), "Handling request");

        match request {
            ClusterRequest::Get { partition, key } => {
                let slot = self.primary_slot(partition)?;
                let local = slot.lock().await;
                self.check_primary(partition, &local, false)?;
                Ok(ClusterResponse::Value(local.data.get(&key).cloned()))
            }
            ClusterRequest::Put {
                partition,
                key,
                value,
            } => {
                let previous = self
                    .write(partition, Mutation::Put { key, value })
                    .await?;
                Ok(ClusterResponse::Value(previous))
            }
            ClusterRequest::Remove { partition, key } => {
                let previous = self.write(partition, Mutation::Remove { key }).await?;
                Ok(ClusterResponse::Value(previous))
            }
            ClusterRequest::Replicate {
                partition,
                mutation,
            } => self.apply_replicated(partition, mutation).await,
            ClusterRequest::Resync { snapshot } => self.resync(snapshot).await,
            ClusterRequest::MapUpdate { snapshot } => {
                self.install_map(snapshot);
                Ok(ClusterResponse::Ack)
            }
            ClusterRequest::FetchMap => Ok(ClusterResponse::Map(self.map.snapshot())),
            ClusterRequest::InitPartitions { partitions } => {
                for partition in partitions {
                    let slot = self.store.get_or_create(partition);
                    let local = slot.lock().await;
                    self.persistence.seed(&local.data.snapshot(partition))?;
                }
                Ok(ClusterResponse::Ack)
            }
            ClusterRequest::ReportPersisted => Ok(ClusterResponse::Persisted(
                self.persistence.stored_partitions()?,
            )),
            ClusterRequest::RecoverPartitions { partitions } => {
                for partition in partitions {
                    let snapshot = self.persistence.recover(partition)?;
                    self.store.insert(
                        partition,
                        LocalPartition::new(PartitionData::from_snapshot(snapshot)),
                    );
                }
                Ok(ClusterResponse::Ack)
            }
            ClusterRequest::CreatePartition { partition } => {
                self.store.insert(partition, LocalPartition::default());
                self.persistence
                    .seed(&PartitionSnapshot::empty(partition))?;
                Ok(ClusterResponse::Ack)
            }
            ClusterRequest::BeginTransfer { task } => self.begin_transfer(task).await,
            ClusterRequest::ReceiveBulk { task, snapshot } => {
                self.receive_bulk(task, snapshot).await
            }
            ClusterRequest::SealTransfer { task, partition } => {
                let slot = self
                    .store
                    .get(partition)
                    .ok_or(ClusterError::PartitionNotFound(partition))?;
                let mut local = slot.lock().await;
                match local.outgoing.as_mut() {
                    Some(outgoing) if outgoing.task == task => {
                        Ok(ClusterResponse::Delta(outgoing.seal()))
                    }
                    _ => Err(ClusterError::TransferAborted {
                        task,
                        reason: "no outgoing transfer to seal".to_string(),
                    }),
                }
            }
            ClusterRequest::ReceiveDelta {
                task,
                partition,
                delta,
            } => self.receive_delta(task, partition, delta).await,
            ClusterRequest::CompleteTransfer { task, partition }
            | ClusterRequest::AbortTransfer { task, partition } => {
                self.finish_transfer(task, partition).await;
                Ok(ClusterResponse::Ack)
            }
        }
    }

    /// Slot of a partition this member is primary of
    fn primary_slot(&self, partition: PartitionId) -> Result<PartitionSlot> {
        self.check_service(partition)?;
        let owner = self.lookup_primary(partition)?;
        if owner != self.local {
            return Err(ClusterError::Redirect {
                partition,
                owner: Some(owner),
            });
        }
        self.store
            .get(partition)
            .ok_or(ClusterError::PartitionOrphaned { partition })
    }

    /// Re-check ownership under the slot lock
    fn check_primary(
        &self,
        partition: PartitionId,
        local: &LocalPartition,
        write: bool,
    ) -> Result<()> {
        let owner = self.lookup_primary(partition)?;
        if owner != self.local {
            return Err(ClusterError::Redirect {
                partition,
                owner: Some(owner),
            });
        }
        if local.incoming.is_some() || (write && local.is_sealed()) {
            return Err(ClusterError::Redirect {
                partition,
                owner: None,
            });
        }
        Ok(())
    }

    /// Primary write path: sequence, persist, apply, capture, replicate
    async fn write(&self, partition: PartitionId, mutation: Mutation) -> Result<Option<Vec<u8>>> {
        let slot = self.primary_slot(partition)?;
        let mut local = slot.lock().await;
        self.check_primary(partition, &local, true)?;

        let sequenced = local.data.next_mutation(mutation);
        self.persistence.write_active(partition, &sequenced)?;
        let (_, previous) = local.data.apply(&sequenced);
        if let Some(outgoing) = local.outgoing.as_mut() {
            outgoing.capture(sequenced.clone());
        }

        let backups = self.map.lookup(partition)?.backups;
        self.replication
            .replicate(partition, &backups, sequenced, &local.data)
            .await?;
        Ok(previous)
    }

    async fn apply_replicated(
        &self,
        partition: PartitionId,
        mutation: SequencedMutation,
    ) -> Result<ClusterResponse> {
        let Some(slot) = self.store.get(partition) else {
            return Ok(ClusterResponse::Replicated(None));
        };
        let mut local = slot.lock().await;
        let outcome = local.data.classify(mutation.seq);
        match outcome {
            ReplicaApply::Applied => {
                self.persistence.write_active(partition, &mutation)?;
                local.data.apply(&mutation);
            }
            ReplicaApply::Duplicate => {
                trace!(partition, seq = mutation.seq, "Duplicate replicated mutation");
            }
            ReplicaApply::Gap { expected, received } => {
                debug!(partition, expected, received, "Replication gap, requesting resync");
            }
        }
        Ok(ClusterResponse::Replicated(Some(outcome)))
    }

    async fn resync(&self, snapshot: PartitionSnapshot) -> Result<ClusterResponse> {
        let partition = snapshot.partition;
        if !self.owns(partition) && !self.store.contains(partition) {
            debug!(partition, "Ignoring resync for partition not held here");
            return Ok(ClusterResponse::Ack);
        }
        let slot = self.store.get_or_create(partition);
        let mut local = slot.lock().await;
        self.persistence.seed(&snapshot)?;
        local.data = PartitionData::from_snapshot(snapshot);
        debug!(partition, seq = local.data.seq(), "Partition resynced");
        Ok(ClusterResponse::Ack)
    }

    fn install_map(&self, snapshot: MapSnapshot) {
        let version = snapshot.version;
        if self.map.install(snapshot.clone()) {
            debug!(version, "Installed partition map");
            return;
        }
        if self.view.is_senior()
            && version == self.map.version()
            && snapshot != self.map.snapshot()
        {
            // two maps share a version; reissue ours above both
            let bumped = self.map.bump();
            warn!(version, bumped, "Conflicting map at equal version, republishing");
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move { coordinator.publish_map().await });
        }
    }

    async fn begin_transfer(&self, task: TransferTask) -> Result<ClusterResponse> {
        let slot = self
            .store
            .get(task.partition)
            .ok_or(ClusterError::PartitionNotFound(task.partition))?;
        let mut local = slot.lock().await;
        if let Some(previous) = local.outgoing_task() {
            debug!(partition = task.partition, task = %previous, "Replacing stale outgoing transfer");
        }
        local.outgoing = Some(OutgoingTransfer::new(task.id, task.destination));
        let bulk = local.data.snapshot(task.partition);
        debug!(
            task = %task.id,
            partition = task.partition,
            entries = bulk.len(),
            lsn = bulk.lsn,
            "Transfer source capturing"
        );
        Ok(ClusterResponse::Bulk(bulk))
    }

    async fn receive_bulk(
        &self,
        task: TransferTask,
        snapshot: PartitionSnapshot,
    ) -> Result<ClusterResponse> {
        let partition = task.partition;
        let holder = self.owns(partition);
        let slot = self.store.get_or_create(partition);
        let mut local = slot.lock().await;
        if holder {
            // a backup taking over as primary may already be ahead
            local.data.install(snapshot);
        } else {
            local.data = PartitionData::from_snapshot(snapshot);
        }
        local.incoming = Some(IncomingTransfer {
            task: task.id,
            source: task.source,
        });
        Ok(ClusterResponse::Ack)
    }

    async fn receive_delta(
        &self,
        task: TransferId,
        partition: PartitionId,
        delta: Vec<SequencedMutation>,
    ) -> Result<ClusterResponse> {
        let slot = self
            .store
            .get(partition)
            .ok_or(ClusterError::PartitionNotFound(partition))?;
        let mut local = slot.lock().await;
        if local.incoming_task() != Some(task) {
            return Err(ClusterError::TransferAborted {
                task,
                reason: "no incoming transfer".to_string(),
            });
        }
        for mutation in &delta {
            if let (ReplicaApply::Gap { expected, received }, _) = local.data.apply(mutation) {
                return Err(ClusterError::ReplicationGap {
                    partition,
                    expected,
                    received,
                });
            }
        }
        self.persistence.seed(&local.data.snapshot(partition))?;
        debug!(
            task = %task,
            partition,
            delta = delta.len(),
            seq = local.data.seq(),
            "Transfer data acknowledged"
        );
        Ok(ClusterResponse::Ack)
    }

    /// Drop transfer state after completion or abort; a copy the map does
    /// not assign here is released
    async fn finish_transfer(&self, task: TransferId, partition: PartitionId) {
        let Some(slot) = self.store.get(partition) else { return };
        let mut local = slot.lock().await;
        if local.outgoing_task() == Some(task) {
            local.outgoing = None;
        }
        if local.incoming_task() == Some(task) {
            local.incoming = None;
        }
        if local.incoming.is_none() && !self.owns(partition) {
            drop(local);
            self.store.remove(partition);
            debug!(partition, task = %task, "Released partition after transfer");
        }
    }
}

impl std::fmt::Debug for PartitionedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedService")
            .field("member", &self.local)
            .field("map_version", &self.map.version())
            .field("partitions", &self.store.len())
            .finish()
    }
}

impl Drop for PartitionedService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Transport-facing handler; holds the service weakly so detaching is
/// enough to drop it
struct ServiceHandler {
    service: Weak<PartitionedService>,
}

#[async_trait]
impl RequestHandler for ServiceHandler {
    async fn handle(&self, source: MemberId, request: ClusterRequest) -> ClusterResponse {
        match self.service.upgrade() {
            Some(service) => service.dispatch(source, request).await.into(),
            None => ClusterResponse::Error(WireError::ShuttingDown),
        }
    }
}

/// Member health information
#[derive(Debug, Clone)]
pub struct GridHealth {
    pub service_status: ServiceStatus,
    pub member: MemberId,
    pub senior: Option<MemberId>,
    pub live_members: usize,
    pub storage_members: usize,
    pub map_version: u64,
    pub partition_count: u32,
    pub owned_primaries: usize,
    pub owned_backups: usize,
    pub orphaned_partitions: usize,
    pub lost_partitions: usize,
    pub under_replicated_partitions: usize,
}

impl GridHealth {
    /// Running with every partition owned
    pub fn is_healthy(&self) -> bool {
        self.service_status == ServiceStatus::Running
            && self.orphaned_partitions == 0
            && self.lost_partitions == 0
    }

    pub fn status(&self) -> &'static str {
        if self.is_healthy() {
            if self.under_replicated_partitions > 0 {
                "degraded"
            } else {
                "healthy"
            }
        } else {
            "unhealthy"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use std::time::Duration;

    async fn single_member() -> Arc<PartitionedService> {
        let transport = Arc::new(LocalTransport::default());
        let config = GridConfig::builder()
            .member_id(1)
            .partition_count(16)
            .backup_count(0)
            .build();
        let member = PartitionedService::start(config, transport).await.unwrap();
        for _ in 0..200 {
            if member.service_status() == ServiceStatus::Running && member.coordinator().is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        member
    }

    #[tokio::test]
    async fn test_single_member_roundtrip() {
        let member = single_member().await;
        assert_eq!(member.service_status(), ServiceStatus::Running);

        assert_eq!(member.put(b"a".to_vec(), b"1".to_vec()).await.unwrap(), None);
        assert_eq!(
            member.put(b"a".to_vec(), b"2".to_vec()).await.unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(member.get(b"a").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(member.remove(b"a").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(member.get(b"a").await.unwrap(), None);
        assert_eq!(member.route(b"a").unwrap(), 1);
        member.halt();
    }

    #[tokio::test]
    async fn test_health_of_single_member() {
        let member = single_member().await;
        let health = member.health();
        assert!(health.is_healthy());
        assert_eq!(health.status(), "healthy");
        assert_eq!(health.owned_primaries, 16);
        assert_eq!(health.senior, Some(1));
        assert_eq!(member.local_partitions().len(), 16);
        member.halt();
    }

    #[tokio::test]
    async fn test_snapshot_requires_persistence() {
        let member = single_member().await;
        assert!(matches!(
            member.snapshot_all().await,
            Err(ClusterError::PersistenceDisabled)
        ));
        member.halt();
    }

    #[tokio::test]
    async fn test_halted_member_rejects_requests() {
        let member = single_member().await;
        member.halt();
        assert!(member.is_stopped());
        let response = member.dispatch(2, ClusterRequest::FetchMap).await;
        assert!(matches!(response, Err(ClusterError::ShuttingDown)));
    }
}
