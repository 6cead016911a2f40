//! Partition persistence
//!
//! Backends store one copy per partition: its entries plus the LSN (the
//! partition sequence) of the last mutation they contain.
//!
//! - **redb**: one database file per partition under the data directory
//! - **memory**: in-process store for tests and ephemeral members
//!
//! The coordinator applies the configured [`PersistenceMode`]: `Active`
//! writes every applied mutation before the write is acknowledged,
//! `OnDemand` writes only explicit or periodic snapshots.

mod memory;
mod redb_store;

pub use memory::MemoryBackend;
pub use redb_store::RedbBackend;

use crate::config::{BackendKind, PersistenceConfig, PersistenceMode};
use crate::error::{ClusterError, Result};
use crate::observability::PersistenceMetrics;
use crate::partition::{PartitionId, PartitionSnapshot, SequencedMutation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier of a written snapshot
pub type SnapshotId = Uuid;

/// A partition copy present in a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPartition {
    pub partition: PartitionId,
    pub lsn: u64,
}

/// Storage for persisted partition copies
pub trait PersistenceBackend: Send + Sync + std::fmt::Debug {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Apply one mutation to the stored copy and advance its LSN
    fn write_active(&self, partition: PartitionId, mutation: &SequencedMutation) -> Result<()>;

    /// Replace the stored copy with a full snapshot
    fn write_snapshot(&self, snapshot: &PartitionSnapshot) -> Result<SnapshotId>;

    /// Load the stored copy, if any
    fn recover(&self, partition: PartitionId) -> Result<Option<PartitionSnapshot>>;

    /// Every stored copy with its LSN
    fn stored_partitions(&self) -> Result<Vec<StoredPartition>>;

    /// Release open handles
    fn close(&self) {}
}

/// Applies the persistence mode on top of a backend
#[derive(Debug, Clone)]
pub struct PersistenceCoordinator {
    mode: PersistenceMode,
    backend: Option<Arc<dyn PersistenceBackend>>,
}

impl PersistenceCoordinator {
    /// Open the backend named by the configuration
    pub fn open(config: &PersistenceConfig) -> Result<Self> {
        if config.mode == PersistenceMode::Disabled {
            return Ok(Self::disabled());
        }
        let backend: Arc<dyn PersistenceBackend> = match config.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Redb => Arc::new(RedbBackend::open(&config.data_dir)?),
        };
        info!(mode = ?config.mode, backend = backend.name(), "Persistence enabled");
        Ok(Self::with_backend(config.mode, backend))
    }

    pub fn with_backend(mode: PersistenceMode, backend: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            mode,
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: PersistenceMode::Disabled,
            backend: None,
        }
    }

    pub fn mode(&self) -> PersistenceMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != PersistenceMode::Disabled && self.backend.is_some()
    }

    fn backend(&self) -> Result<&Arc<dyn PersistenceBackend>> {
        match (&self.backend, self.mode) {
            (Some(backend), mode) if mode != PersistenceMode::Disabled => Ok(backend),
            _ => Err(ClusterError::PersistenceDisabled),
        }
    }

    /// Persist one applied mutation (active mode only)
    pub fn write_active(&self, partition: PartitionId, mutation: &SequencedMutation) -> Result<()> {
        if self.mode != PersistenceMode::Active {
            return Ok(());
        }
        self.backend()?.write_active(partition, mutation)?;
        PersistenceMetrics::increment_active_writes();
        Ok(())
    }

    /// Seed the stored copy after a partition arrived by transfer or resync
    /// (active mode only)
    pub fn seed(&self, snapshot: &PartitionSnapshot) -> Result<()> {
        if self.mode != PersistenceMode::Active {
            return Ok(());
        }
        self.backend()?.write_snapshot(snapshot)?;
        Ok(())
    }

    /// Write a full snapshot of a partition
    pub fn snapshot(&self, snapshot: &PartitionSnapshot) -> Result<SnapshotId> {
        let backend = self.backend()?;
        let started = Instant::now();
        let id = backend.write_snapshot(snapshot)?;
        PersistenceMetrics::increment_snapshots();
        PersistenceMetrics::record_snapshot_duration(started.elapsed());
        debug!(
            partition = snapshot.partition,
            lsn = snapshot.lsn,
            entries = snapshot.len(),
            snapshot = %id,
            "Partition snapshot written"
        );
        Ok(id)
    }

    /// Load the stored copy of a partition
    pub fn recover(&self, partition: PartitionId) -> Result<PartitionSnapshot> {
        let snapshot = self
            .backend()?
            .recover(partition)?
            .ok_or(ClusterError::SnapshotNotFound { partition })?;
        PersistenceMetrics::increment_recoveries();
        info!(
            partition,
            lsn = snapshot.lsn,
            entries = snapshot.len(),
            "Partition recovered from persistence"
        );
        Ok(snapshot)
    }

    /// Stored copies; empty when persistence is disabled
    pub fn stored_partitions(&self) -> Result<Vec<StoredPartition>> {
        match self.backend() {
            Ok(backend) => backend.stored_partitions(),
            Err(_) => Ok(Vec::new()),
        }
    }

    pub fn close(&self) {
        if let Some(backend) = &self.backend {
            backend.close();
        }
    }
}
