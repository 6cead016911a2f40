//! redb persistence backend
//!
//! One database file per partition (`partition-00042.redb`) so partitions can
//! be written, recovered and removed independently.

use super::{PersistenceBackend, SnapshotId, StoredPartition};
use crate::error::{ClusterError, Result};
use crate::partition::{Mutation, PartitionId, PartitionSnapshot, SequencedMutation};
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Partition entries (key: entry key, value: entry value)
const ENTRIES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");

/// Partition metadata (key: string, value: postcard-encoded data)
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const KEY_LSN: &str = "lsn";
const KEY_SNAPSHOT: &str = "snapshot";

const FILE_PREFIX: &str = "partition-";
const FILE_SUFFIX: &str = ".redb";

fn storage_err(e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Persistence(e.to_string())
}

/// redb-backed partition store
pub struct RedbBackend {
    dir: PathBuf,
    databases: DashMap<PartitionId, Arc<Database>>,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("dir", &self.dir)
            .field("open_partitions", &self.databases.len())
            .finish()
    }
}

impl RedbBackend {
    /// Open (creating if needed) the store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ClusterError::Persistence(format!("Failed to create dir: {}", e)))?;
        info!(dir = %dir.display(), "Opened redb partition store");
        Ok(Self {
            dir,
            databases: DashMap::new(),
        })
    }

    fn path_for(&self, partition: PartitionId) -> PathBuf {
        self.dir
            .join(format!("{}{:05}{}", FILE_PREFIX, partition, FILE_SUFFIX))
    }

    fn parse_file_name(name: &str) -> Option<PartitionId> {
        name.strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_SUFFIX)?
            .parse()
            .ok()
    }

    fn database(&self, partition: PartitionId) -> Result<Arc<Database>> {
        if let Some(db) = self.databases.get(&partition) {
            return Ok(db.clone());
        }
        let path = self.path_for(partition);
        let db = self
            .databases
            .entry(partition)
            .or_try_insert_with(|| {
                Database::create(&path).map(Arc::new).map_err(|e| {
                    ClusterError::Persistence(format!("Failed to open redb: {}", e))
                })
            })?;
        Ok(db.clone())
    }

    fn read_lsn(db: &Database) -> Result<Option<u64>> {
        let read_txn = db.begin_read().map_err(storage_err)?;
        let table = match read_txn.open_table(META_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(storage_err(e)),
        };
        let Some(value) = table.get(KEY_LSN).map_err(storage_err)? else {
            return Ok(None);
        };
        Ok(Some(postcard::from_bytes(value.value())?))
    }
}

impl PersistenceBackend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn write_active(&self, partition: PartitionId, mutation: &SequencedMutation) -> Result<()> {
        let db = self.database(partition)?;
        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            let mut entries = write_txn.open_table(ENTRIES_TABLE).map_err(storage_err)?;
            match &mutation.mutation {
                Mutation::Put { key, value } => {
                    entries
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(storage_err)?;
                }
                Mutation::Remove { key } => {
                    entries.remove(key.as_slice()).map_err(storage_err)?;
                }
            }

            let mut meta = write_txn.open_table(META_TABLE).map_err(storage_err)?;
            let current: u64 = match meta.get(KEY_LSN).map_err(storage_err)? {
                Some(value) => postcard::from_bytes(value.value())?,
                None => 0,
            };
            let lsn = postcard::to_allocvec(&current.max(mutation.seq))?;
            meta.insert(KEY_LSN, lsn.as_slice()).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn write_snapshot(&self, snapshot: &PartitionSnapshot) -> Result<SnapshotId> {
        let db = self.database(snapshot.partition)?;
        let id = Uuid::new_v4();

        let write_txn = db.begin_write().map_err(storage_err)?;
        write_txn.delete_table(ENTRIES_TABLE).map_err(storage_err)?;
        {
            let mut entries = write_txn.open_table(ENTRIES_TABLE).map_err(storage_err)?;
            for (key, value) in &snapshot.entries {
                entries
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(storage_err)?;
            }

            let mut meta = write_txn.open_table(META_TABLE).map_err(storage_err)?;
            let lsn = postcard::to_allocvec(&snapshot.lsn)?;
            meta.insert(KEY_LSN, lsn.as_slice()).map_err(storage_err)?;
            let snapshot_id = postcard::to_allocvec(&id)?;
            meta.insert(KEY_SNAPSHOT, snapshot_id.as_slice())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;

        debug!(
            partition = snapshot.partition,
            lsn = snapshot.lsn,
            "Wrote partition snapshot to redb"
        );
        Ok(id)
    }

    fn recover(&self, partition: PartitionId) -> Result<Option<PartitionSnapshot>> {
        if !self.databases.contains_key(&partition) && !self.path_for(partition).exists() {
            return Ok(None);
        }
        let db = self.database(partition)?;
        let Some(lsn) = Self::read_lsn(&db)? else {
            return Ok(None);
        };

        let read_txn = db.begin_read().map_err(storage_err)?;
        let mut entries = Vec::new();
        match read_txn.open_table(ENTRIES_TABLE) {
            Ok(table) => {
                for item in table.iter().map_err(storage_err)? {
                    let (key, value) = item.map_err(storage_err)?;
                    entries.push((key.value().to_vec(), value.value().to_vec()));
                }
            }
            Err(TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(storage_err(e)),
        }

        Ok(Some(PartitionSnapshot {
            partition,
            lsn,
            entries,
        }))
    }

    fn stored_partitions(&self) -> Result<Vec<StoredPartition>> {
        let mut stored = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(partition) = name.to_str().and_then(Self::parse_file_name) else {
                continue;
            };
            let db = self.database(partition)?;
            if let Some(lsn) = Self::read_lsn(&db)? {
                stored.push(StoredPartition { partition, lsn });
            }
        }
        stored.sort_by_key(|s| s.partition);
        Ok(stored)
    }

    fn close(&self) {
        self.databases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

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
    fn test_active_writes_and_recover() {
        let dir = TempDir::new().unwrap();
        let backend = RedbBackend::open(dir.path()).unwrap();

        backend.write_active(7, &put(1, "a", "1")).unwrap();
        backend.write_active(7, &put(2, "b", "2")).unwrap();
        backend
            .write_active(
                7,
                &SequencedMutation {
                    seq: 3,
                    mutation: Mutation::Remove { key: b"a".to_vec() },
                },
            )
            .unwrap();

        let snapshot = backend.recover(7).unwrap().unwrap();
        assert_eq!(snapshot.lsn, 3);
        assert_eq!(snapshot.entries, vec![(b"b".to_vec(), b"2".to_vec())]);
        assert!(backend.recover(8).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = RedbBackend::open(dir.path()).unwrap();
            backend.write_active(1, &put(1, "old", "x")).unwrap();
            backend
                .write_snapshot(&PartitionSnapshot {
                    partition: 1,
                    lsn: 40,
                    entries: vec![(b"k".to_vec(), b"v".to_vec())],
                })
                .unwrap();
            backend.write_active(12, &put(5, "z", "z")).unwrap();
            backend.close();
        }

        let backend = RedbBackend::open(dir.path()).unwrap();
        assert_eq!(
            backend.stored_partitions().unwrap(),
            vec![
                StoredPartition {
                    partition: 1,
                    lsn: 40
                },
                StoredPartition {
                    partition: 12,
                    lsn: 5
                },
            ]
        );

        let snapshot = backend.recover(1).unwrap().unwrap();
        assert_eq!(snapshot.entries, vec![(b"k".to_vec(), b"v".to_vec())]);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(RedbBackend::parse_file_name("partition-00042.redb"), Some(42));
        assert_eq!(RedbBackend::parse_file_name("partition-x.redb"), None);
        assert_eq!(RedbBackend::parse_file_name("other.db"), None);
    }
}
