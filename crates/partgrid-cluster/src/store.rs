//! Member-local partition slots
//!
//! Every partition a member holds (as primary, backup, or transfer
//! destination) lives in a slot guarded by an async mutex, which serializes
//! writes, replication applies and transfer steps on that partition.

use crate::member::MemberId;
use crate::partition::{PartitionData, PartitionId};
use crate::transfer::{IncomingTransfer, OutgoingTransfer, TransferId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One locally held partition copy
#[derive(Debug, Default)]
pub struct LocalPartition {
    pub data: PartitionData,
    /// Set while this copy is the destination of a transfer
    pub incoming: Option<IncomingTransfer>,
    /// Set while this copy is the source of a transfer
    pub outgoing: Option<OutgoingTransfer>,
}

impl LocalPartition {
    pub fn new(data: PartitionData) -> Self {
        Self {
            data,
            incoming: None,
            outgoing: None,
        }
    }

    /// Writes are refused once the outgoing transfer sealed the partition
    pub fn is_sealed(&self) -> bool {
        self.outgoing.as_ref().map(|o| o.sealed).unwrap_or(false)
    }

    pub fn incoming_task(&self) -> Option<TransferId> {
        self.incoming.map(|i| i.task)
    }

    pub fn outgoing_task(&self) -> Option<TransferId> {
        self.outgoing.as_ref().map(|o| o.task)
    }

    /// Drop transfer state that involves `member`; returns whether anything
    /// was cleared
    pub fn clear_transfers_with(&mut self, member: MemberId) -> bool {
        let mut cleared = false;
        if self.outgoing.as_ref().map(|o| o.destination) == Some(member) {
            self.outgoing = None;
            cleared = true;
        }
        if self.incoming.map(|i| i.source) == Some(member) {
            self.incoming = None;
            cleared = true;
        }
        cleared
    }
}

/// Shared handle to a slot
pub type PartitionSlot = Arc<Mutex<LocalPartition>>;

/// All partition slots of one member
#[derive(Debug, Default)]
pub struct LocalStore {
    slots: DashMap<PartitionId, PartitionSlot>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: PartitionId) -> Option<PartitionSlot> {
        self.slots.get(&partition).map(|s| s.value().clone())
    }

    /// Get the slot, creating an empty one if absent
    pub fn get_or_create(&self, partition: PartitionId) -> PartitionSlot {
        self.slots
            .entry(partition)
            .or_insert_with(|| Arc::new(Mutex::new(LocalPartition::default())))
            .clone()
    }

    /// Insert or replace a slot
    pub fn insert(&self, partition: PartitionId, local: LocalPartition) -> PartitionSlot {
        let slot = Arc::new(Mutex::new(local));
        self.slots.insert(partition, slot.clone());
        slot
    }

    pub fn remove(&self, partition: PartitionId) -> Option<PartitionSlot> {
        self.slots.remove(&partition).map(|(_, slot)| slot)
    }

    pub fn contains(&self, partition: PartitionId) -> bool {
        self.slots.contains_key(&partition)
    }

    /// Held partitions in ascending order
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self.slots.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
