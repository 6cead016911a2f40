//! Grid events published to local subscribers

use crate::member::MemberId;
use crate::partition::PartitionId;
use crate::quorum::ServiceStatus;
use crate::transfer::{TransferId, TransferRole};

/// Notable grid events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridEvent {
    /// No surviving copy of the partition exists; emitted once per loss
    DataLoss { partition: PartitionId },

    /// A partition was restored from a persisted copy
    PartitionRecovered {
        partition: PartitionId,
        member: MemberId,
        lsn: u64,
    },

    /// A lost partition was recreated empty
    PartitionRecreated {
        partition: PartitionId,
        member: MemberId,
    },

    /// A backup took over as primary after its primary departed
    PrimaryPromoted {
        partition: PartitionId,
        member: MemberId,
    },

    TransferCompleted {
        task: TransferId,
        partition: PartitionId,
        role: TransferRole,
        source: MemberId,
        destination: MemberId,
    },

    TransferAborted {
        task: TransferId,
        partition: PartitionId,
        reason: String,
    },

    /// Partitions below the configured backup count after a planning round;
    /// emitted when the count changes
    UnderReplicated { partitions: Vec<PartitionId> },

    /// A newer ownership map was installed locally
    MapInstalled { version: u64 },

    SeniorChanged {
        previous: Option<MemberId>,
        current: Option<MemberId>,
    },

    StatusChanged {
        previous: ServiceStatus,
        current: ServiceStatus,
    },
}

impl GridEvent {
    /// Partition the event is about, if any
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            GridEvent::DataLoss { partition }
            | GridEvent::PartitionRecovered { partition, .. }
            | GridEvent::PartitionRecreated { partition, .. }
            | GridEvent::PrimaryPromoted { partition, .. }
            | GridEvent::TransferCompleted { partition, .. }
            | GridEvent::TransferAborted { partition, .. } => Some(*partition),
            _ => None,
        }
    }

    pub fn is_data_loss(&self) -> bool {
        matches!(self, GridEvent::DataLoss { .. })
    }
}
