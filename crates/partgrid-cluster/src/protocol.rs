//! Wire protocol between grid members

use crate::error::{ClusterError, Result};
use crate::member::MemberId;
use crate::partition::{PartitionId, PartitionSnapshot, ReplicaApply, SequencedMutation};
use crate::partition_map::MapSnapshot;
use crate::persistence::StoredPartition;
use crate::transfer::{TransferId, TransferTask};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum protocol version we can interoperate with
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Maximum encoded frame size (64 MB, bulk partition copies included)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Request header included in all requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Protocol version
    pub version: u16,
    /// Correlation ID for matching responses
    pub correlation_id: u64,
    /// Sending member
    pub source: MemberId,
}

impl RequestHeader {
    pub fn new(correlation_id: u64, source: MemberId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            source,
        }
    }

    pub fn validate_version(&self) -> Result<()> {
        if self.version < MIN_PROTOCOL_VERSION || self.version > PROTOCOL_VERSION {
            return Err(ClusterError::Protocol(format!(
                "unsupported protocol version {}: supported range [{}, {}]",
                self.version, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}

/// Requests exchanged between members
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum ClusterRequest {
    // ==================== Data Requests ====================
    Get {
        partition: PartitionId,
        key: Vec<u8>,
    },
    Put {
        partition: PartitionId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Remove {
        partition: PartitionId,
        key: Vec<u8>,
    },

    // ==================== Replication ====================
    /// Primary -> backup, one sequenced mutation
    Replicate {
        partition: PartitionId,
        mutation: SequencedMutation,
    },
    /// Primary -> backup, full state after a gap or a missing replica
    Resync { snapshot: PartitionSnapshot },

    // ==================== Ownership ====================
    /// Senior -> member, new ownership map
    MapUpdate { snapshot: MapSnapshot },
    /// Any member -> senior, current ownership map
    FetchMap,
    /// Senior -> member, create empty partitions for the first distribution
    InitPartitions { partitions: Vec<PartitionId> },
    /// Senior -> member, list persisted partition copies
    ReportPersisted,
    /// Senior -> member, load these partitions from persistence
    RecoverPartitions { partitions: Vec<PartitionId> },
    /// Senior -> member, create an empty partition (lost partition recreated)
    CreatePartition { partition: PartitionId },

    // ==================== Transfer ====================
    /// Senior -> source, start capturing and return the bulk copy
    BeginTransfer { task: TransferTask },
    /// Senior -> destination, install the bulk copy
    ReceiveBulk {
        task: TransferTask,
        snapshot: PartitionSnapshot,
    },
    /// Senior -> source, stop writes and return captured mutations
    SealTransfer {
        task: TransferId,
        partition: PartitionId,
    },
    /// Senior -> destination, apply captured mutations
    ReceiveDelta {
        task: TransferId,
        partition: PartitionId,
        delta: Vec<SequencedMutation>,
    },
    /// Senior -> source and destination, map updated
    CompleteTransfer {
        task: TransferId,
        partition: PartitionId,
    },
    /// Senior -> source and destination, discard transfer state
    AbortTransfer {
        task: TransferId,
        partition: PartitionId,
    },
}

impl ClusterRequest {
    /// Short name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterRequest::Get { .. } => "get",
            ClusterRequest::Put { .. } => "put",
            ClusterRequest::Remove { .. } => "remove",
            ClusterRequest::Replicate { .. } => "replicate",
            ClusterRequest::Resync { .. } => "resync",
            ClusterRequest::MapUpdate { .. } => "map_update",
            ClusterRequest::FetchMap => "fetch_map",
            ClusterRequest::InitPartitions { .. } => "init_partitions",
            ClusterRequest::ReportPersisted => "report_persisted",
            ClusterRequest::RecoverPartitions { .. } => "recover_partitions",
            ClusterRequest::CreatePartition { .. } => "create_partition",
            ClusterRequest::BeginTransfer { .. } => "begin_transfer",
            ClusterRequest::ReceiveBulk { .. } => "receive_bulk",
            ClusterRequest::SealTransfer { .. } => "seal_transfer",
            ClusterRequest::ReceiveDelta { .. } => "receive_delta",
            ClusterRequest::CompleteTransfer { .. } => "complete_transfer",
            ClusterRequest::AbortTransfer { .. } => "abort_transfer",
        }
    }

    /// Client write that changes partition data
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ClusterRequest::Put { .. } | ClusterRequest::Remove { .. }
        )
    }
}

/// Errors that cross the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    Redirect {
        partition: PartitionId,
        owner: Option<MemberId>,
    },
    ServiceSuspended {
        required: usize,
        live: usize,
    },
    DataLoss {
        partition: PartitionId,
    },
    PartitionOrphaned {
        partition: PartitionId,
    },
    Conflict {
        partition: PartitionId,
        expected: u64,
        actual: u64,
    },
    TransferAborted {
        task: TransferId,
        reason: String,
    },
    NotSenior {
        senior: Option<MemberId>,
    },
    SnapshotNotFound {
        partition: PartitionId,
    },
    MemberUnreachable {
        member: MemberId,
    },
    ReplicationFailed {
        partition: PartitionId,
        backups: Vec<MemberId>,
    },
    Timeout,
    SeniorUnavailable,
    PersistenceDisabled,
    ShuttingDown,
    Other(String),
}

impl From<&ClusterError> for WireError {
    fn from(e: &ClusterError) -> Self {
        match e {
            ClusterError::Redirect { partition, owner } => WireError::Redirect {
                partition: *partition,
                owner: *owner,
            },
            ClusterError::ServiceSuspended { required, live } => WireError::ServiceSuspended {
                required: *required,
                live: *live,
            },
            ClusterError::DataLoss { partition } => WireError::DataLoss {
                partition: *partition,
            },
            ClusterError::PartitionOrphaned { partition } => WireError::PartitionOrphaned {
                partition: *partition,
            },
            ClusterError::Conflict {
                partition,
                expected,
                actual,
            } => WireError::Conflict {
                partition: *partition,
                expected: *expected,
                actual: *actual,
            },
            ClusterError::TransferAborted { task, reason } => WireError::TransferAborted {
                task: *task,
                reason: reason.clone(),
            },
            ClusterError::NotSenior { senior } => WireError::NotSenior { senior: *senior },
            ClusterError::SnapshotNotFound { partition } => WireError::SnapshotNotFound {
                partition: *partition,
            },
            ClusterError::MemberUnreachable { member } => {
                WireError::MemberUnreachable { member: *member }
            }
            ClusterError::ReplicationFailed { partition, backups } => {
                WireError::ReplicationFailed {
                    partition: *partition,
                    backups: backups.clone(),
                }
            }
            ClusterError::Timeout => WireError::Timeout,
            ClusterError::SeniorUnavailable => WireError::SeniorUnavailable,
            ClusterError::PersistenceDisabled => WireError::PersistenceDisabled,
            ClusterError::ShuttingDown => WireError::ShuttingDown,
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for ClusterError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Redirect { partition, owner } => ClusterError::Redirect { partition, owner },
            WireError::ServiceSuspended { required, live } => {
                ClusterError::ServiceSuspended { required, live }
            }
            WireError::DataLoss { partition } => ClusterError::DataLoss { partition },
            WireError::PartitionOrphaned { partition } => {
                ClusterError::PartitionOrphaned { partition }
            }
            WireError::Conflict {
                partition,
                expected,
                actual,
            } => ClusterError::Conflict {
                partition,
                expected,
                actual,
            },
            WireError::TransferAborted { task, reason } => {
                ClusterError::TransferAborted { task, reason }
            }
            WireError::NotSenior { senior } => ClusterError::NotSenior { senior },
            WireError::SnapshotNotFound { partition } => {
                ClusterError::SnapshotNotFound { partition }
            }
            WireError::MemberUnreachable { member } => ClusterError::MemberUnreachable { member },
            WireError::ReplicationFailed { partition, backups } => {
                ClusterError::ReplicationFailed { partition, backups }
            }
            WireError::Timeout => ClusterError::Timeout,
            WireError::SeniorUnavailable => ClusterError::SeniorUnavailable,
            WireError::PersistenceDisabled => ClusterError::PersistenceDisabled,
            WireError::ShuttingDown => ClusterError::ShuttingDown,
            WireError::Other(message) => ClusterError::Internal(message),
        }
    }
}

/// Responses to [`ClusterRequest`]s
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum ClusterResponse {
    Ack,
    /// Current or previous value of a key
    Value(Option<Vec<u8>>),
    /// Backup outcome for a replicated mutation; `None` when the backup holds
    /// no copy of the partition
    Replicated(Option<ReplicaApply>),
    Map(MapSnapshot),
    Persisted(Vec<StoredPartition>),
    Bulk(PartitionSnapshot),
    Delta(Vec<SequencedMutation>),
    Error(WireError),
}

impl ClusterResponse {
    /// Turn an error response into an `Err`
    pub fn into_result(self) -> Result<ClusterResponse> {
        match self {
            ClusterResponse::Error(e) => Err(e.into()),
            other => Ok(other),
        }
    }
}

impl From<Result<ClusterResponse>> for ClusterResponse {
    fn from(result: Result<ClusterResponse>) -> Self {
        match result {
            Ok(response) => response,
            Err(e) => ClusterResponse::Error(WireError::from(&e)),
        }
    }
}

/// A request with its header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub header: RequestHeader,
    pub request: ClusterRequest,
}

/// A response with the correlation id of its request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub correlation_id: u64,
    pub response: ClusterResponse,
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_MESSAGE_SIZE {
        return Err(ClusterError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Encode a request frame to bytes
pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>> {
    let bytes = postcard::to_allocvec(frame)?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Decode a request frame and check its protocol version
pub fn decode_request(bytes: &[u8]) -> Result<RequestFrame> {
    check_size(bytes.len())?;
    let frame: RequestFrame = postcard::from_bytes(bytes)?;
    frame.header.validate_version()?;
    Ok(frame)
}

/// Encode a response frame to bytes
pub fn encode_response(frame: &ResponseFrame) -> Result<Vec<u8>> {
    let bytes = postcard::to_allocvec(frame)?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Decode a response frame
pub fn decode_response(bytes: &[u8]) -> Result<ResponseFrame> {
    check_size(bytes.len())?;
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Mutation;
    use crate::transfer::TransferRole;

    #[test]
    fn test_request_frame_roundtrip() {
        let task = TransferTask::new(12, 1, 2, TransferRole::Backup, Some(3));
        let frame = RequestFrame {
            header: RequestHeader::new(99, 1),
            request: ClusterRequest::ReceiveBulk {
                task: task.clone(),
                snapshot: PartitionSnapshot {
                    partition: 12,
                    lsn: 4,
                    entries: vec![(b"k".to_vec(), b"v".to_vec())],
                },
            },
        };

        let decoded = decode_request(&encode_request(&frame).unwrap()).unwrap();
        assert_eq!(decoded.header.correlation_id, 99);
        match decoded.request {
            ClusterRequest::ReceiveBulk { task: t, snapshot } => {
                assert_eq!(t, task);
                assert_eq!(snapshot.lsn, 4);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_version_rejected() {
        let mut header = RequestHeader::new(1, 1);
        header.version = PROTOCOL_VERSION + 1;
        let frame = RequestFrame {
            header,
            request: ClusterRequest::FetchMap,
        };
        let bytes = postcard::to_allocvec(&frame).unwrap();
        assert!(matches!(
            decode_request(&bytes),
            Err(ClusterError::Protocol(_))
        ));
    }

    #[test]
    fn test_error_crosses_wire() {
        let err = ClusterError::Redirect {
            partition: 5,
            owner: Some(2),
        };
        let frame = ResponseFrame {
            correlation_id: 7,
            response: ClusterResponse::from(Err::<ClusterResponse, _>(err)),
        };
        let decoded = decode_response(&encode_response(&frame).unwrap()).unwrap();
        let result = decoded.response.into_result();
        assert!(matches!(
            result,
            Err(ClusterError::Redirect {
                partition: 5,
                owner: Some(2)
            })
        ));
    }

    #[test]
    fn test_internal_errors_flatten() {
        let wire = WireError::from(&ClusterError::ChannelClosed);
        assert_eq!(wire, WireError::Other("channel closed".to_string()));
        assert!(matches!(
            ClusterError::from(wire),
            ClusterError::Internal(_)
        ));
    }

    #[test]
    fn test_request_kind() {
        let request = ClusterRequest::Replicate {
            partition: 1,
            mutation: SequencedMutation {
                seq: 1,
                mutation: Mutation::Remove { key: vec![1] },
            },
        };
        assert_eq!(request.kind(), "replicate");
        assert!(!request.is_mutation());
        assert!(ClusterRequest::Remove {
            partition: 1,
            key: vec![1]
        }
        .is_mutation());
    }

    #[test]
    fn test_indeterminate_errors_keep_their_kind() {
        let err = ClusterError::ReplicationFailed {
            partition: 3,
            backups: vec![2, 4],
        };
        let result = ClusterResponse::from(Err::<ClusterResponse, _>(err)).into_result();
        assert!(matches!(
            result,
            Err(ClusterError::ReplicationFailed { partition: 3, ref backups }) if backups == &vec![2, 4]
        ));
        let result = ClusterResponse::Error(WireError::from(&ClusterError::Timeout)).into_result();
        assert!(matches!(result, Err(ClusterError::Timeout)));
    }
}
