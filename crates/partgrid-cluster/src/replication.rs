//! Primary-to-backup replication
//!
//! Every mutation a primary applies carries the partition sequence. Backups
//! apply mutations strictly in sequence order; a backup that sees a gap, or
//! holds no copy at all, answers so and the primary ships a full resync.
//!
//! Backup modes:
//! - sync: the write is acknowledged after every live backup applied it;
//!   only backups the view already dropped are skipped
//! - async: the write is acknowledged at once; a per-partition worker ships
//!   mutations in order

use crate::config::{BackupMode, ReplicationConfig};
use crate::error::{ClusterError, Result};
use crate::member::MemberId;
use crate::membership::MembershipView;
use crate::observability::ReplicationMetrics;
use crate::partition::{PartitionData, PartitionId, PartitionSnapshot, ReplicaApply, SequencedMutation};
use crate::protocol::{ClusterRequest, ClusterResponse};
use crate::store::LocalStore;
use crate::transport::ClusterTransport;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sends replication traffic from one member
#[derive(Clone)]
struct BackupChannel {
    local: MemberId,
    transport: Arc<dyn ClusterTransport>,
    config: ReplicationConfig,
}

impl BackupChannel {
    /// Ship one mutation; `None` means the backup holds no copy
    async fn send(
        &self,
        partition: PartitionId,
        backup: MemberId,
        mutation: SequencedMutation,
    ) -> Result<Option<ReplicaApply>> {
        ReplicationMetrics::increment_sent();
        let request = ClusterRequest::Replicate {
            partition,
            mutation,
        };
        let response = tokio::time::timeout(
            self.config.ack_timeout,
            self.transport.send(self.local, backup, request),
        )
        .await??;
        match response.into_result()? {
            ClusterResponse::Replicated(outcome) => Ok(outcome),
            other => Err(ClusterError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    async fn resync(&self, backup: MemberId, snapshot: PartitionSnapshot) -> Result<()> {
        ReplicationMetrics::increment_resyncs();
        info!(
            partition = snapshot.partition,
            backup,
            lsn = snapshot.lsn,
            "Resyncing backup"
        );
        self.transport
            .send(self.local, backup, ClusterRequest::Resync { snapshot })
            .await?
            .into_result()?;
        Ok(())
    }
}

struct ReplicationJob {
    backups: Vec<MemberId>,
    mutation: SequencedMutation,
}

/// Replication for every partition this member is primary of
pub struct ReplicationManager {
    channel: BackupChannel,
    view: Arc<MembershipView>,
    store: Arc<LocalStore>,
    queues: DashMap<PartitionId, mpsc::UnboundedSender<ReplicationJob>>,
}

impl ReplicationManager {
    pub fn new(
        local: MemberId,
        config: ReplicationConfig,
        transport: Arc<dyn ClusterTransport>,
        view: Arc<MembershipView>,
        store: Arc<LocalStore>,
    ) -> Self {
        Self {
            channel: BackupChannel {
                local,
                transport,
                config,
            },
            view,
            store,
            queues: DashMap::new(),
        }
    }

    pub fn mode(&self) -> BackupMode {
        self.channel.config.mode
    }

    /// Propagate an applied mutation to the partition's backups.
    ///
    /// `data` is the primary's copy after applying `mutation`; it is only
    /// read when a backup needs a resync. In sync mode this returns after
    /// every live backup applied the mutation, and fails with
    /// `ReplicationFailed` when one of them did not.
    pub async fn replicate(
        &self,
        partition: PartitionId,
        backups: &[MemberId],
        mutation: SequencedMutation,
        data: &PartitionData,
    ) -> Result<()> {
        if backups.is_empty() {
            return Ok(());
        }
        match self.mode() {
            BackupMode::Sync => {
                self.replicate_sync(partition, backups, mutation, data)
                    .await
            }
            BackupMode::Async => self.enqueue(partition, backups.to_vec(), mutation),
        }
    }

    async fn replicate_sync(
        &self,
        partition: PartitionId,
        backups: &[MemberId],
        mutation: SequencedMutation,
        data: &PartitionData,
    ) -> Result<()> {
        let started = Instant::now();
        let results = join_all(
            backups
                .iter()
                .map(|backup| self.channel.send(partition, *backup, mutation.clone())),
        )
        .await;

        let mut lagging = Vec::new();
        let mut failed = Vec::new();
        for (backup, result) in backups.iter().zip(results) {
            match result {
                Ok(Some(ReplicaApply::Applied)) | Ok(Some(ReplicaApply::Duplicate)) => {}
                Ok(Some(ReplicaApply::Gap { expected, received })) => {
                    debug!(partition, backup, expected, received, "Backup reported gap");
                    lagging.push(*backup);
                }
                Ok(None) => lagging.push(*backup),
                Err(e) => {
                    ReplicationMetrics::increment_failures();
                    warn!(partition, backup, error = %e, "Backup replication failed");
                    failed.push(*backup);
                }
            }
        }

        if !lagging.is_empty() {
            let snapshot = data.snapshot(partition);
            for backup in lagging {
                if let Err(e) = self.channel.resync(backup, snapshot.clone()).await {
                    ReplicationMetrics::increment_failures();
                    warn!(partition, backup, error = %e, "Backup resync failed");
                    failed.push(backup);
                }
            }
        }

        ReplicationMetrics::record_ack_latency(started.elapsed());

        // departed backups are dropped from the map by the senior
        failed.retain(|backup| self.view.contains(*backup));
        if !failed.is_empty() {
            failed.sort_unstable();
            return Err(ClusterError::ReplicationFailed {
                partition,
                backups: failed,
            });
        }
        Ok(())
    }

    fn enqueue(
        &self,
        partition: PartitionId,
        backups: Vec<MemberId>,
        mutation: SequencedMutation,
    ) -> Result<()> {
        let tx = self
            .queues
            .entry(partition)
            .or_insert_with(|| self.spawn_worker(partition))
            .clone();
        tx.send(ReplicationJob { backups, mutation })?;
        Ok(())
    }

    fn spawn_worker(&self, partition: PartitionId) -> mpsc::UnboundedSender<ReplicationJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ReplicationJob>();
        let channel = self.channel.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                for backup in job.backups {
                    let outcome = channel
                        .send(partition, backup, job.mutation.clone())
                        .await;
                    let needs_resync = match outcome {
                        Ok(Some(ReplicaApply::Gap { .. })) | Ok(None) => true,
                        Ok(Some(_)) => false,
                        Err(e) => {
                            ReplicationMetrics::increment_failures();
                            warn!(partition, backup, error = %e, "Async replication failed");
                            false
                        }
                    };
                    if !needs_resync {
                        continue;
                    }
                    let Some(slot) = store.get(partition) else { break };
                    let snapshot = slot.lock().await.data.snapshot(partition);
                    if let Err(e) = channel.resync(backup, snapshot).await {
                        warn!(partition, backup, error = %e, "Async resync failed");
                    }
                }
            }
            debug!(partition, "Replication worker stopped");
        });

        tx
    }

    /// Stop the async worker of a partition this member no longer leads
    pub fn release(&self, partition: PartitionId) {
        self.queues.remove(&partition);
    }

    /// Stop every async worker
    pub fn shutdown(&self) {
        self.queues.clear();
    }
}
