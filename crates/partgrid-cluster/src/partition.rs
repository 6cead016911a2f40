//! Partition identity and partition-local data

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partition identifier in `[0, partition_count)`
pub type PartitionId = u32;

/// Map a key to its partition.
///
/// FNV-1a over the raw key bytes, so every member computes the same
/// partition regardless of platform.
pub fn partition_for_key(key: &[u8], partition_count: u32) -> PartitionId {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in key {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % partition_count.max(1) as u64) as PartitionId
}

/// A single change to partition data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

impl Mutation {
    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Put { key, .. } | Mutation::Remove { key } => key,
        }
    }
}

/// A mutation stamped with the partition's sequence number.
///
/// The sequence doubles as the persistence LSN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedMutation {
    pub seq: u64,
    pub mutation: Mutation,
}

/// How a replica relates to an incoming sequenced mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaApply {
    /// Next in sequence, applied
    Applied,
    /// Already applied (seq at or below the current one)
    Duplicate,
    /// One or more predecessors are missing
    Gap { expected: u64, received: u64 },
}

/// Full copy of one partition at a given sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub partition: PartitionId,
    pub lsn: u64,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl PartitionSnapshot {
    pub fn empty(partition: PartitionId) -> Self {
        Self {
            partition,
            lsn: 0,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Key/value contents of one partition plus its sequence counter
#[derive(Debug, Clone, Default)]
pub struct PartitionData {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    seq: u64,
}

impl PartitionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: PartitionSnapshot) -> Self {
        Self {
            entries: snapshot.entries.into_iter().collect(),
            seq: snapshot.lsn,
        }
    }

    /// Sequence of the last applied mutation
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.entries.get(key)
    }

    /// Stamp a new mutation with the next sequence (primary side)
    pub fn next_mutation(&self, mutation: Mutation) -> SequencedMutation {
        SequencedMutation {
            seq: self.seq + 1,
            mutation,
        }
    }

    /// Classify an incoming mutation against the current sequence
    pub fn classify(&self, seq: u64) -> ReplicaApply {
        if seq <= self.seq {
            ReplicaApply::Duplicate
        } else if seq == self.seq + 1 {
            ReplicaApply::Applied
        } else {
            ReplicaApply::Gap {
                expected: self.seq + 1,
                received: seq,
            }
        }
    }

    /// Apply a mutation if it is next in sequence.
    ///
    /// Returns the classification and, when applied, the previous value.
    pub fn apply(&mut self, mutation: &SequencedMutation) -> (ReplicaApply, Option<Vec<u8>>) {
        let outcome = self.classify(mutation.seq);
        if outcome != ReplicaApply::Applied {
            return (outcome, None);
        }

        let previous = match &mutation.mutation {
            Mutation::Put { key, value } => self.entries.insert(key.clone(), value.clone()),
            Mutation::Remove { key } => self.entries.remove(key),
        };
        self.seq = mutation.seq;
        (outcome, previous)
    }

    /// Replace contents with a snapshot if it is not older than what we hold
    pub fn install(&mut self, snapshot: PartitionSnapshot) -> bool {
        if snapshot.lsn < self.seq {
            return false;
        }
        *self = Self::from_snapshot(snapshot);
        true
    }

    pub fn snapshot(&self, partition: PartitionId) -> PartitionSnapshot {
        PartitionSnapshot {
            partition,
            lsn: self.seq,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(seq: u64, key: &str, value: &str) -> SequencedMutation {
        SequencedMutation {
            seq,
            mutation: Mutation::Put {
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
            },
        }
    }

    #[test]
    fn test_partition_for_key_is_stable() {
        let p1 = partition_for_key(b"customer-42", 257);
        let p2 = partition_for_key(b"customer-42", 257);
        assert_eq!(p1, p2);
        assert!(p1 < 257);

        // FNV-1a of the empty input is the offset basis
        assert_eq!(
            partition_for_key(b"", 257),
            (0xcbf29ce484222325u64 % 257) as u32
        );
    }

    #[test]
    fn test_partition_for_key_spreads() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..2000 {
            seen.insert(partition_for_key(format!("key-{}", i).as_bytes(), 257));
        }
        assert!(seen.len() > 200);
    }

    #[test]
    fn test_apply_in_order() {
        let mut data = PartitionData::new();
        let (outcome, previous) = data.apply(&put(1, "a", "1"));
        assert_eq!(outcome, ReplicaApply::Applied);
        assert_eq!(previous, None);

        let (_, previous) = data.apply(&put(2, "a", "2"));
        assert_eq!(previous, Some(b"1".to_vec()));
        assert_eq!(data.get(b"a"), Some(&b"2".to_vec()));
        assert_eq!(data.seq(), 2);
    }

    #[test]
    fn test_duplicate_and_gap() {
        let mut data = PartitionData::new();
        data.apply(&put(1, "a", "1"));

        let (outcome, _) = data.apply(&put(1, "a", "other"));
        assert_eq!(outcome, ReplicaApply::Duplicate);
        assert_eq!(data.get(b"a"), Some(&b"1".to_vec()));

        let (outcome, _) = data.apply(&put(3, "b", "3"));
        assert_eq!(
            outcome,
            ReplicaApply::Gap {
                expected: 2,
                received: 3
            }
        );
        assert_eq!(data.seq(), 1);
        assert!(data.get(b"b").is_none());
    }

    #[test]
    fn test_remove() {
        let mut data = PartitionData::new();
        data.apply(&put(1, "a", "1"));
        let remove = data.next_mutation(Mutation::Remove { key: b"a".to_vec() });
        assert_eq!(remove.seq, 2);

        let (_, previous) = data.apply(&remove);
        assert_eq!(previous, Some(b"1".to_vec()));
        assert!(data.is_empty());
    }

    #[test]
    fn test_install_rejects_older_snapshot() {
        let mut data = PartitionData::new();
        data.apply(&put(1, "a", "1"));
        data.apply(&put(2, "b", "2"));

        let stale = PartitionSnapshot::empty(0);
        assert!(!data.install(stale));
        assert_eq!(data.len(), 2);

        let mut other = PartitionData::new();
        assert!(other.install(data.snapshot(0)));
        assert_eq!(other.seq(), 2);
        assert_eq!(other.get(b"b"), Some(&b"2".to_vec()));
    }
}
