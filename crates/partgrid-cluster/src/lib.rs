//! # Partgrid Cluster
//!
//! Partition ownership engine for the partgrid in-memory data grid:
//! - **Partition Map**: versioned primary/backup ownership with compare-and-set updates
//! - **Senior coordination**: one elected member plans and drives every ownership change
//! - **Transfers**: bulk copy plus captured delta, so no acknowledged write is lost
//! - **Backup replication**: per-partition sequenced mutations, sync or async
//! - **Persistence**: pluggable backends (memory, redb) and highest-LSN cluster recovery
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     PartitionedService                       │
//! ├───────────────┬───────────────────┬──────────────────────────┤
//! │  Membership   │   Ownership       │     Data Layer           │
//! │     View      │   Coordinator     │                          │
//! ├───────────────┼───────────────────┼──────────────────────────┤
//! │ • Join order  │ • Repairs         │ • Primary writes         │
//! │ • Incarnation │ • Rebalance plans │ • Backup replication     │
//! │ • Senior      │ • Transfers       │ • Persistence            │
//! │   election    │ • Recovery        │ • Routed get/put/remove  │
//! └───────────────┴───────────────────┴──────────────────────────┘
//!            ▲                  │
//!            │   ClusterTransport (ordered membership + messaging)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use partgrid_cluster::{GridConfig, LocalTransport, PartitionedService};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(LocalTransport::default());
//!
//! let config = GridConfig::builder()
//!     .member_id(1)
//!     .partition_count(257)
//!     .backup_count(1)
//!     .build();
//! let member = PartitionedService::start(config, transport.clone()).await?;
//!
//! member.put(b"user:42".to_vec(), b"alice".to_vec()).await?;
//! let owner = member.route(b"user:42")?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod member;
pub mod membership;
pub mod observability;
pub mod partition;
pub mod partition_map;
pub mod persistence;
pub mod placement;
pub mod protocol;
pub mod quorum;
pub mod replication;
pub mod retry;
pub mod service;
pub mod store;
pub mod transfer;
pub mod transport;

// Re-export main types
pub use config::{
    BackendKind, BackupMode, GridConfig, GridConfigBuilder, MembershipConfig, PartitionConfig,
    PersistenceConfig, PersistenceMode, QuorumConfig, ReplicationConfig, TransferConfig,
    DEFAULT_PARTITION_COUNT, MAX_BACKUP_COUNT,
};
pub use coordinator::OwnershipCoordinator;
pub use error::{ClusterError, Result};
pub use events::GridEvent;
pub use member::{Member, MemberId, MemberInfo, MemberRole};
pub use membership::{MembershipEvent, MembershipView, SequencedEvent, ViewChange};
pub use observability::{GridMetrics, PersistenceMetrics, ReplicationMetrics, TransferMetrics};
pub use partition::{
    partition_for_key, Mutation, PartitionData, PartitionId, PartitionSnapshot, ReplicaApply,
    SequencedMutation,
};
pub use partition_map::{
    MapSnapshot, OwnershipRole, PartitionMap, PartitionOwnership, SharedPartitionMap,
};
pub use persistence::{
    MemoryBackend, PersistenceBackend, PersistenceCoordinator, RedbBackend, SnapshotId,
    StoredPartition,
};
pub use placement::{DistributionStats, PartitionPlacer, PlannedTransfer, RebalancePlan, Repair};
pub use protocol::{ClusterRequest, ClusterResponse};
pub use quorum::{QuorumGate, QuorumPolicy, ServiceStatus};
pub use replication::ReplicationManager;
pub use retry::RetryConfig;
pub use service::{GridHealth, PartitionedService};
pub use transfer::{TransferId, TransferRole, TransferState, TransferTask};
pub use transport::{ClusterTransport, LocalTransport, RequestHandler, TransportConfig};

/// Re-export common types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::events::GridEvent;
    pub use crate::member::*;
    pub use crate::partition::*;
    pub use crate::quorum::ServiceStatus;
    pub use crate::service::{GridHealth, PartitionedService};
}
