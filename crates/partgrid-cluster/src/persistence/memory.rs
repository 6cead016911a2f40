//! In-memory persistence backend

use super::{PersistenceBackend, SnapshotId, StoredPartition};
use crate::error::Result;
use crate::partition::{Mutation, PartitionId, PartitionSnapshot, SequencedMutation};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoredCopy {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    lsn: u64,
}

/// Keeps persisted copies in process memory.
///
/// Share one instance across member restarts (via `Arc`) to simulate disk
/// that outlives a member.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    partitions: Mutex<HashMap<PartitionId, StoredCopy>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write_active(&self, partition: PartitionId, mutation: &SequencedMutation) -> Result<()> {
        let mut partitions = self.partitions.lock();
        let copy = partitions.entry(partition).or_default();
        match &mutation.mutation {
            Mutation::Put { key, value } => {
                copy.entries.insert(key.clone(), value.clone());
            }
            Mutation::Remove { key } => {
                copy.entries.remove(key);
            }
        }
        copy.lsn = copy.lsn.max(mutation.seq);
        Ok(())
    }

    fn write_snapshot(&self, snapshot: &PartitionSnapshot) -> Result<SnapshotId> {
        let copy = StoredCopy {
            entries: snapshot.entries.iter().cloned().collect(),
            lsn: snapshot.lsn,
        };
        self.partitions.lock().insert(snapshot.partition, copy);
        Ok(Uuid::new_v4())
    }

    fn recover(&self, partition: PartitionId) -> Result<Option<PartitionSnapshot>> {
        Ok(self.partitions.lock().get(&partition).map(|copy| PartitionSnapshot {
            partition,
            lsn: copy.lsn,
            entries: copy
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }))
    }

    fn stored_partitions(&self) -> Result<Vec<StoredPartition>> {
        let mut stored: Vec<StoredPartition> = self
            .partitions
            .lock()
            .iter()
            .map(|(partition, copy)| StoredPartition {
                partition: *partition,
                lsn: copy.lsn,
            })
            .collect();
        stored.sort_by_key(|s| s.partition);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_replaces_active_state() {
        let backend = MemoryBackend::new();
        backend
            .write_active(
                0,
                &SequencedMutation {
                    seq: 1,
                    mutation: Mutation::Put {
                        key: b"stale".to_vec(),
                        value: b"x".to_vec(),
                    },
                },
            )
            .unwrap();

        let snapshot = PartitionSnapshot {
            partition: 0,
            lsn: 9,
            entries: vec![(b"k".to_vec(), b"v".to_vec())],
        };
        backend.write_snapshot(&snapshot).unwrap();

        assert_eq!(backend.recover(0).unwrap(), Some(snapshot));
        assert_eq!(backend.recover(1).unwrap(), None);
    }
}
