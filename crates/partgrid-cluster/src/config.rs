//! Grid configuration

use crate::error::{ClusterError, Result};
use crate::member::{MemberId, MemberRole};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default partition count (a prime spreads keys evenly)
pub const DEFAULT_PARTITION_COUNT: u32 = 257;

/// Upper bound on backups per partition
pub const MAX_BACKUP_COUNT: usize = 6;

/// Grid member configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Member identifier (unique across the grid)
    pub member_id: MemberId,

    /// Human-readable member name
    pub member_name: Option<String>,

    /// Whether this member stores partitions
    pub role: MemberRole,

    /// Partitioning configuration
    pub partitions: PartitionConfig,

    /// Backup replication configuration
    pub replication: ReplicationConfig,

    /// Partition transfer configuration
    pub transfer: TransferConfig,

    /// Quorum thresholds
    pub quorum: QuorumConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Membership configuration
    pub membership: MembershipConfig,

    /// Retry policy for routed requests
    pub client_retry: RetryConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self::single(1)
    }
}

impl GridConfig {
    /// Configuration for a single storage-enabled member with defaults
    pub fn single(member_id: MemberId) -> Self {
        Self {
            member_id,
            member_name: None,
            role: MemberRole::StorageEnabled,
            partitions: PartitionConfig::default(),
            replication: ReplicationConfig::default(),
            transfer: TransferConfig::default(),
            quorum: QuorumConfig::default(),
            persistence: PersistenceConfig::default(),
            membership: MembershipConfig::default(),
            client_retry: RetryConfig::default(),
        }
    }

    /// Create a configuration builder
    pub fn builder() -> GridConfigBuilder {
        GridConfigBuilder::new()
    }

    /// Reject configurations the grid cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.partitions.partition_count == 0 {
            return Err(ClusterError::InvalidConfig(
                "partition_count must be at least 1".to_string(),
            ));
        }
        if self.partitions.backup_count > MAX_BACKUP_COUNT {
            return Err(ClusterError::InvalidConfig(format!(
                "backup_count ({}) exceeds the maximum of {}",
                self.partitions.backup_count, MAX_BACKUP_COUNT
            )));
        }
        if self.transfer.max_concurrent_transfers == 0 {
            return Err(ClusterError::InvalidConfig(
                "max_concurrent_transfers must be at least 1".to_string(),
            ));
        }
        if self.quorum.service_quorum == 0 {
            return Err(ClusterError::InvalidConfig(
                "service_quorum must be at least 1".to_string(),
            ));
        }
        if self.quorum.recovery_quorum < self.quorum.service_quorum {
            return Err(ClusterError::InvalidConfig(format!(
                "recovery_quorum ({}) must not be below service_quorum ({})",
                self.quorum.recovery_quorum, self.quorum.service_quorum
            )));
        }
        if self.persistence.mode != PersistenceMode::Disabled
            && self.persistence.backend == BackendKind::Redb
            && self.persistence.data_dir.as_os_str().is_empty()
        {
            return Err(ClusterError::InvalidConfig(
                "redb persistence requires a data_dir".to_string(),
            ));
        }
        if let Some(interval) = self.persistence.snapshot_interval {
            if interval.is_zero() {
                return Err(ClusterError::InvalidConfig(
                    "snapshot_interval must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Whether this member holds partition data
    pub fn is_storage_enabled(&self) -> bool {
        self.role.is_storage_enabled()
    }
}

/// Builder for grid configuration
#[derive(Debug, Default)]
pub struct GridConfigBuilder {
    member_id: Option<MemberId>,
    member_name: Option<String>,
    role: Option<MemberRole>,
    partitions: Option<PartitionConfig>,
    replication: Option<ReplicationConfig>,
    transfer: Option<TransferConfig>,
    quorum: Option<QuorumConfig>,
    persistence: Option<PersistenceConfig>,
    membership: Option<MembershipConfig>,
    client_retry: Option<RetryConfig>,
}

impl GridConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member_id(mut self, id: MemberId) -> Self {
        self.member_id = Some(id);
        self
    }

    pub fn member_name(mut self, name: impl Into<String>) -> Self {
        self.member_name = Some(name.into());
        self
    }

    pub fn role(mut self, role: MemberRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn storage_disabled(self) -> Self {
        self.role(MemberRole::StorageDisabled)
    }

    pub fn partition_count(mut self, count: u32) -> Self {
        self.partitions
            .get_or_insert_with(PartitionConfig::default)
            .partition_count = count;
        self
    }

    pub fn backup_count(mut self, count: usize) -> Self {
        self.partitions
            .get_or_insert_with(PartitionConfig::default)
            .backup_count = count;
        self
    }

    pub fn replication(mut self, config: ReplicationConfig) -> Self {
        self.replication = Some(config);
        self
    }

    pub fn transfer(mut self, config: TransferConfig) -> Self {
        self.transfer = Some(config);
        self
    }

    pub fn quorum(mut self, config: QuorumConfig) -> Self {
        self.quorum = Some(config);
        self
    }

    pub fn persistence(mut self, config: PersistenceConfig) -> Self {
        self.persistence = Some(config);
        self
    }

    pub fn membership(mut self, config: MembershipConfig) -> Self {
        self.membership = Some(config);
        self
    }

    pub fn client_retry(mut self, config: RetryConfig) -> Self {
        self.client_retry = Some(config);
        self
    }

    pub fn build(self) -> GridConfig {
        GridConfig {
            member_id: self.member_id.unwrap_or(1),
            member_name: self.member_name,
            role: self.role.unwrap_or_default(),
            partitions: self.partitions.unwrap_or_default(),
            replication: self.replication.unwrap_or_default(),
            transfer: self.transfer.unwrap_or_default(),
            quorum: self.quorum.unwrap_or_default(),
            persistence: self.persistence.unwrap_or_default(),
            membership: self.membership.unwrap_or_default(),
            client_retry: self.client_retry.unwrap_or_default(),
        }
    }
}

/// Partitioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Fixed number of partitions for the lifetime of the service
    pub partition_count: u32,

    /// Desired backups per partition
    pub backup_count: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            backup_count: 1,
        }
    }
}

/// How writes reach backups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Acknowledge a write only after every backup applied it
    #[default]
    Sync,
    /// Acknowledge immediately, ship to backups in order afterwards
    Async,
}

/// Backup replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Sync or async backup propagation
    pub mode: BackupMode,

    /// Time to wait for a backup acknowledgement
    pub ack_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: BackupMode::Sync,
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// Partition transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Upper bound on transfers running at once
    pub max_concurrent_transfers: usize,

    /// Rebalance rounds per trigger before waiting for the next trigger
    pub max_rebalance_rounds: u32,

    /// Retry policy for map compare-and-set and failed rounds
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 16,
            max_rebalance_rounds: 64,
            retry: RetryConfig::default(),
        }
    }
}

/// Quorum thresholds, all counted in live storage-enabled members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Minimum needed to serve requests and move partitions
    pub service_quorum: usize,

    /// Minimum needed before a partition may be declared lost
    pub loss_quorum: usize,

    /// Minimum needed before the first distribution or a recovery from
    /// persistence starts
    pub recovery_quorum: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            service_quorum: 1,
            loss_quorum: 1,
            recovery_quorum: 1,
        }
    }
}

impl QuorumConfig {
    pub fn new(service_quorum: usize, loss_quorum: usize, recovery_quorum: usize) -> Self {
        Self {
            service_quorum,
            loss_quorum,
            recovery_quorum,
        }
    }
}

/// Persistence behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Nothing reaches disk
    #[default]
    Disabled,
    /// Every applied mutation is written before the write is acknowledged
    Active,
    /// Only explicit or periodic snapshots are written
    OnDemand,
}

/// Which persistence backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store, survives only as long as the backend value
    #[default]
    Memory,
    /// One redb file per partition under `data_dir`
    Redb,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub mode: PersistenceMode,
    pub backend: BackendKind,

    /// Root directory for persisted partitions
    pub data_dir: PathBuf,

    /// Periodic snapshot of owned partitions
    pub snapshot_interval: Option<Duration>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            mode: PersistenceMode::Disabled,
            backend: BackendKind::Memory,
            data_dir: PathBuf::from("./data"),
            snapshot_interval: None,
        }
    }
}

impl PersistenceConfig {
    /// Active persistence into redb files under `dir`
    pub fn active(dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: PersistenceMode::Active,
            backend: BackendKind::Redb,
            data_dir: dir.into(),
            snapshot_interval: None,
        }
    }

    /// On-demand persistence into redb files under `dir`
    pub fn on_demand(dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: PersistenceMode::OnDemand,
            ..Self::active(dir)
        }
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }
}

/// Membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Optional ordered succession list for the senior role. The first live
    /// storage-enabled member in this list wins; otherwise the earliest
    /// joined member does.
    pub succession: Vec<MemberId>,

    /// Capacity of the view-change broadcast channel
    pub event_buffer: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            succession: Vec::new(),
            event_buffer: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GridConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.partitions.partition_count, DEFAULT_PARTITION_COUNT);
        assert_eq!(config.partitions.backup_count, 1);
        assert_eq!(config.replication.mode, BackupMode::Sync);
        assert_eq!(config.persistence.mode, PersistenceMode::Disabled);
    }

    #[test]
    fn test_builder() {
        let config = GridConfig::builder()
            .member_id(3)
            .member_name("cache-3")
            .partition_count(31)
            .backup_count(2)
            .quorum(QuorumConfig::new(2, 2, 3))
            .persistence(PersistenceConfig::on_demand("/tmp/grid"))
            .build();

        assert_eq!(config.member_id, 3);
        assert_eq!(config.member_name.as_deref(), Some("cache-3"));
        assert_eq!(config.partitions.partition_count, 31);
        assert_eq!(config.partitions.backup_count, 2);
        assert_eq!(config.quorum.recovery_quorum, 3);
        assert_eq!(config.persistence.mode, PersistenceMode::OnDemand);
        assert_eq!(config.persistence.backend, BackendKind::Redb);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = GridConfig::builder().partition_count(0).build();
        assert!(matches!(
            config.validate(),
            Err(ClusterError::InvalidConfig(_))
        ));

        let config = GridConfig::builder()
            .quorum(QuorumConfig::new(3, 1, 2))
            .build();
        assert!(config.validate().is_err());

        let config = GridConfig::builder()
            .backup_count(MAX_BACKUP_COUNT + 1)
            .build();
        assert!(config.validate().is_err());

        let mut config = GridConfig::default();
        config.transfer.max_concurrent_transfers = 0;
        assert!(config.validate().is_err());

        let config = GridConfig::builder()
            .persistence(PersistenceConfig::active("").with_snapshot_interval(Duration::ZERO))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrips_through_postcard() {
        let config = GridConfig::builder().member_id(8).backup_count(2).build();
        let bytes = postcard::to_allocvec(&config).unwrap();
        let decoded: GridConfig = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.member_id, 8);
        assert_eq!(decoded.partitions.backup_count, 2);
    }
}
