//! Partition ownership map
//!
//! Records the primary owner and ordered backups of every partition. Each
//! change bumps the partition's version and the map's global version, and
//! changes are compare-and-set against the partition version so a stale
//! writer never overwrites newer ownership.

use crate::error::{ClusterError, Result};
use crate::member::MemberId;
use crate::partition::PartitionId;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::watch;

/// Which replica slot of a partition an assignment targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipRole {
    Primary,
    /// Backup at the given index (0 = first backup)
    Backup(usize),
}

/// Ownership of a single partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwnership {
    pub primary: Option<MemberId>,
    pub backups: Vec<MemberId>,
    /// Global map version of the last change to this partition
    pub version: u64,
}

impl PartitionOwnership {
    pub fn new(primary: Option<MemberId>, backups: Vec<MemberId>) -> Self {
        Self {
            primary,
            backups,
            version: 0,
        }
    }

    /// Every member holding a copy, primary first
    pub fn owners(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.primary.into_iter().chain(self.backups.iter().copied())
    }

    pub fn holds(&self, member: MemberId) -> bool {
        self.owners().any(|m| m == member)
    }

    pub fn role_of(&self, member: MemberId) -> Option<OwnershipRole> {
        if self.primary == Some(member) {
            return Some(OwnershipRole::Primary);
        }
        self.backups
            .iter()
            .position(|b| *b == member)
            .map(OwnershipRole::Backup)
    }

    pub fn is_orphaned(&self) -> bool {
        self.primary.is_none()
    }

    fn check_distinct(&self, partition: PartitionId) -> Result<()> {
        let mut seen = BTreeSet::new();
        for member in self.owners() {
            if !seen.insert(member) {
                return Err(ClusterError::DuplicateOwner { partition, member });
            }
        }
        Ok(())
    }
}

/// Serializable copy of the whole map, used for broadcast and install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub version: u64,
    pub initialized: bool,
    pub partitions: Vec<PartitionOwnership>,
    /// Partitions declared lost; they stay unowned until recreated
    pub lost: BTreeSet<PartitionId>,
}

impl MapSnapshot {
    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn get(&self, partition: PartitionId) -> Option<&PartitionOwnership> {
        self.partitions.get(partition as usize)
    }

    /// Primary count per member
    pub fn primary_counts(&self) -> HashMap<MemberId, usize> {
        let mut counts = HashMap::new();
        for entry in &self.partitions {
            if let Some(primary) = entry.primary {
                *counts.entry(primary).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Backup count per member
    pub fn backup_counts(&self) -> HashMap<MemberId, usize> {
        let mut counts = HashMap::new();
        for entry in &self.partitions {
            for backup in &entry.backups {
                *counts.entry(*backup).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// The ownership map
#[derive(Debug, Clone)]
pub struct PartitionMap {
    version: u64,
    initialized: bool,
    partitions: Vec<PartitionOwnership>,
    lost: BTreeSet<PartitionId>,
}

impl PartitionMap {
    /// Empty, uninitialized map with every partition unowned
    pub fn new(partition_count: u32) -> Self {
        Self {
            version: 0,
            initialized: false,
            partitions: vec![PartitionOwnership::default(); partition_count as usize],
            lost: BTreeSet::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_lost(&self, partition: PartitionId) -> bool {
        self.lost.contains(&partition)
    }

    pub fn lost(&self) -> &BTreeSet<PartitionId> {
        &self.lost
    }

    /// Current ownership of a partition
    pub fn lookup(&self, partition: PartitionId) -> Result<&PartitionOwnership> {
        self.partitions
            .get(partition as usize)
            .ok_or(ClusterError::PartitionNotFound(partition))
    }

    pub fn primary(&self, partition: PartitionId) -> Option<MemberId> {
        self.lookup(partition).ok().and_then(|e| e.primary)
    }

    /// Partitions whose primary is `member`
    pub fn primaries_of(&self, member: MemberId) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(_, e)| e.primary == Some(member))
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    /// Partitions where `member` holds a backup
    pub fn backups_of(&self, member: MemberId) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(_, e)| e.backups.contains(&member))
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    /// Partitions without a primary that are not declared lost
    pub fn orphaned(&self) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(p, e)| e.primary.is_none() && !self.lost.contains(&(*p as PartitionId)))
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    fn entry_mut(
        &mut self,
        partition: PartitionId,
        expected_version: u64,
    ) -> Result<&mut PartitionOwnership> {
        let entry = self
            .partitions
            .get_mut(partition as usize)
            .ok_or(ClusterError::PartitionNotFound(partition))?;
        if entry.version != expected_version {
            return Err(ClusterError::Conflict {
                partition,
                expected: expected_version,
                actual: entry.version,
            });
        }
        Ok(entry)
    }

    fn commit(&mut self, partition: PartitionId, updated: PartitionOwnership) -> u64 {
        self.version += 1;
        let version = self.version;
        let entry = &mut self.partitions[partition as usize];
        *entry = updated;
        entry.version = version;
        if entry.primary.is_some() {
            self.lost.remove(&partition);
        }
        version
    }

    /// Set or clear one replica slot of a partition.
    ///
    /// Fails with `Conflict` when `expected_version` is not the partition's
    /// current version and with `DuplicateOwner` when the member already
    /// holds another slot. Returns the new map version.
    pub fn assign(
        &mut self,
        partition: PartitionId,
        role: OwnershipRole,
        member: Option<MemberId>,
        expected_version: u64,
    ) -> Result<u64> {
        let mut updated = self.entry_mut(partition, expected_version)?.clone();

        match role {
            OwnershipRole::Primary => updated.primary = member,
            OwnershipRole::Backup(index) => match (member, index.cmp(&updated.backups.len())) {
                (Some(m), std::cmp::Ordering::Less) => updated.backups[index] = m,
                (Some(m), std::cmp::Ordering::Equal) => updated.backups.push(m),
                (None, std::cmp::Ordering::Less) => {
                    updated.backups.remove(index);
                }
                _ => {
                    return Err(ClusterError::InvalidAssignment {
                        partition,
                        reason: format!(
                            "backup index {} out of range ({} backups)",
                            index,
                            updated.backups.len()
                        ),
                    })
                }
            },
        }

        updated.check_distinct(partition)?;
        Ok(self.commit(partition, updated))
    }

    /// Make `member` the primary.
    ///
    /// If `member` is currently a backup it leaves its backup slot. With
    /// `demote_previous` the old primary takes that slot instead, which turns
    /// a primary handoff to an existing backup into a role swap.
    pub fn promote(
        &mut self,
        partition: PartitionId,
        member: MemberId,
        demote_previous: bool,
        expected_version: u64,
    ) -> Result<u64> {
        let mut updated = self.entry_mut(partition, expected_version)?.clone();
        let previous = updated.primary;

        match updated.backups.iter().position(|b| *b == member) {
            Some(index) => match previous {
                Some(old) if demote_previous => updated.backups[index] = old,
                _ => {
                    updated.backups.remove(index);
                }
            },
            None => {
                if let (Some(old), true) = (previous, demote_previous) {
                    updated.backups.insert(0, old);
                }
            }
        }
        updated.primary = Some(member);

        updated.check_distinct(partition)?;
        Ok(self.commit(partition, updated))
    }

    /// Declare a partition lost: no owners, reported until recreated
    pub fn mark_lost(&mut self, partition: PartitionId, expected_version: u64) -> Result<u64> {
        self.entry_mut(partition, expected_version)?;
        let version = self.commit(partition, PartitionOwnership::default());
        self.lost.insert(partition);
        Ok(version)
    }

    /// Install the first distribution in one step.
    ///
    /// `assignments` must cover every partition; `lost` lists partitions that
    /// stay unowned and reported.
    pub fn initialize(
        &mut self,
        assignments: Vec<PartitionOwnership>,
        lost: BTreeSet<PartitionId>,
    ) -> Result<u64> {
        if self.initialized {
            return Err(ClusterError::InvalidAssignment {
                partition: 0,
                reason: "map already initialized".to_string(),
            });
        }
        if assignments.len() != self.partitions.len() {
            return Err(ClusterError::InvalidAssignment {
                partition: assignments.len() as PartitionId,
                reason: format!(
                    "expected {} assignments, got {}",
                    self.partitions.len(),
                    assignments.len()
                ),
            });
        }
        for (p, entry) in assignments.iter().enumerate() {
            entry.check_distinct(p as PartitionId)?;
        }

        self.version += 1;
        let version = self.version;
        self.partitions = assignments
            .into_iter()
            .map(|mut entry| {
                entry.version = version;
                entry
            })
            .collect();
        self.lost = lost;
        self.initialized = true;
        Ok(version)
    }

    /// Re-issue the whole map at a fresh version without changing ownership
    pub fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub fn snapshot(&self) -> MapSnapshot {
        MapSnapshot {
            version: self.version,
            initialized: self.initialized,
            partitions: self.partitions.clone(),
            lost: self.lost.clone(),
        }
    }

    /// Install a snapshot if it is strictly newer than the local map
    pub fn install(&mut self, snapshot: MapSnapshot) -> bool {
        if snapshot.version <= self.version
            || snapshot.partitions.len() != self.partitions.len()
        {
            return false;
        }
        self.version = snapshot.version;
        self.initialized = snapshot.initialized;
        self.partitions = snapshot.partitions;
        self.lost = snapshot.lost;
        true
    }

    /// Check that no member holds two copies of the same partition and that
    /// lost partitions are unowned
    pub fn validate(&self) -> Result<()> {
        for (p, entry) in self.partitions.iter().enumerate() {
            let partition = p as PartitionId;
            entry.check_distinct(partition)?;
            if self.lost.contains(&partition) && entry.owners().next().is_some() {
                return Err(ClusterError::InvalidAssignment {
                    partition,
                    reason: "lost partition still has owners".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A partition map shared by one member's tasks.
///
/// Every change is published on a watch channel carrying the map version.
#[derive(Debug)]
pub struct SharedPartitionMap {
    inner: RwLock<PartitionMap>,
    version_tx: watch::Sender<u64>,
}

impl SharedPartitionMap {
    pub fn new(partition_count: u32) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(PartitionMap::new(partition_count)),
            version_tx,
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PartitionMap> {
        self.inner.read()
    }

    /// Receiver notified with the version after every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version()
    }

    pub fn snapshot(&self) -> MapSnapshot {
        self.inner.read().snapshot()
    }

    pub fn lookup(&self, partition: PartitionId) -> Result<PartitionOwnership> {
        self.inner.read().lookup(partition).cloned()
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut PartitionMap) -> Result<T>) -> Result<T> {
        let mut map = self.inner.write();
        let result = f(&mut map)?;
        self.version_tx.send_replace(map.version());
        Ok(result)
    }

    pub fn assign(
        &self,
        partition: PartitionId,
        role: OwnershipRole,
        member: Option<MemberId>,
        expected_version: u64,
    ) -> Result<u64> {
        self.mutate(|map| map.assign(partition, role, member, expected_version))
    }

    pub fn promote(
        &self,
        partition: PartitionId,
        member: MemberId,
        demote_previous: bool,
        expected_version: u64,
    ) -> Result<u64> {
        self.mutate(|map| map.promote(partition, member, demote_previous, expected_version))
    }

    pub fn mark_lost(&self, partition: PartitionId, expected_version: u64) -> Result<u64> {
        self.mutate(|map| map.mark_lost(partition, expected_version))
    }

    pub fn initialize(
        &self,
        assignments: Vec<PartitionOwnership>,
        lost: BTreeSet<PartitionId>,
    ) -> Result<u64> {
        self.mutate(|map| map.initialize(assignments, lost))
    }

    pub fn bump(&self) -> u64 {
        let mut map = self.inner.write();
        let version = map.bump();
        self.version_tx.send_replace(version);
        version
    }

    pub fn install(&self, snapshot: MapSnapshot) -> bool {
        let mut map = self.inner.write();
        let installed = map.install(snapshot);
        if installed {
            self.version_tx.send_replace(map.version());
        }
        installed
    }
}
