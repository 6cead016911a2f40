//! Grid error types

use crate::member::MemberId;
use crate::partition::PartitionId;
use thiserror::Error;
use uuid::Uuid;

/// Result type for grid operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Grid errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Ownership Errors ====================
    #[error("stale ownership update for partition {partition}: expected version {expected}, current {actual}")]
    Conflict {
        partition: PartitionId,
        expected: u64,
        actual: u64,
    },

    #[error("partition {partition} is not owned here (owner: {owner:?})")]
    Redirect {
        partition: PartitionId,
        owner: Option<MemberId>,
    },

    #[error("member {member} already owns a replica of partition {partition}")]
    DuplicateOwner {
        partition: PartitionId,
        member: MemberId,
    },

    #[error("invalid assignment for partition {partition}: {reason}")]
    InvalidAssignment {
        partition: PartitionId,
        reason: String,
    },

    #[error("partition not found: {0}")]
    PartitionNotFound(PartitionId),

    #[error("partition {partition} has no primary owner")]
    PartitionOrphaned { partition: PartitionId },

    #[error("data loss: no surviving copy of partition {partition}")]
    DataLoss { partition: PartitionId },

    // ==================== Quorum Errors ====================
    #[error("service suspended: need {required} storage members, have {live}")]
    ServiceSuspended { required: usize, live: usize },

    // ==================== Membership Errors ====================
    #[error("member unreachable: {member}")]
    MemberUnreachable { member: MemberId },

    #[error("no senior member available")]
    SeniorUnavailable,

    #[error("not the senior member (senior: {senior:?})")]
    NotSenior { senior: Option<MemberId> },

    #[error("membership event out of order: expected sequence {expected}, got {received}")]
    MembershipOutOfOrder { expected: u64, received: u64 },

    // ==================== Transfer / Replication Errors ====================
    #[error("transfer {task} aborted: {reason}")]
    TransferAborted { task: Uuid, reason: String },

    #[error("replication gap on partition {partition}: expected sequence {expected}, got {received}")]
    ReplicationGap {
        partition: PartitionId,
        expected: u64,
        received: u64,
    },

    #[error("partition {partition}: live backups {backups:?} did not apply the write")]
    ReplicationFailed {
        partition: PartitionId,
        backups: Vec<MemberId>,
    },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ClusterError> },

    // ==================== Persistence Errors ====================
    #[error("no persisted copy of partition {partition}")]
    SnapshotNotFound { partition: PartitionId },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("persistence disabled")]
    PersistenceDisabled,

    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Protocol Errors ====================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    // ==================== Internal Errors ====================
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timeout")]
    Timeout,

    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Check if this error is retried internally (or by a routing client)
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::Conflict { .. }
                | ClusterError::Redirect { .. }
                | ClusterError::TransferAborted { .. }
                | ClusterError::SeniorUnavailable
                | ClusterError::MemberUnreachable { .. }
                | ClusterError::PartitionOrphaned { .. }
                | ClusterError::ReplicationFailed { .. }
                | ClusterError::Timeout
        )
    }

    /// The request may have taken effect before this error was raised, so
    /// resending a mutation could apply it twice
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout | ClusterError::ReplicationFailed { .. }
        )
    }

    /// Check if the caller should re-route the request
    pub fn should_redirect(&self) -> bool {
        matches!(self, ClusterError::Redirect { .. })
    }

    /// Get the suggested owner if this is a Redirect error
    pub fn redirect_target(&self) -> Option<MemberId> {
        match self {
            ClusterError::Redirect { owner, .. } => *owner,
            _ => None,
        }
    }

    /// Conditions that must always reach the caller and are never hidden
    /// behind automatic recovery
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            ClusterError::DataLoss { .. } | ClusterError::ServiceSuspended { .. }
        )
    }

    /// Check if this is a fatal error requiring shutdown
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::Persistence(_) | ClusterError::Io(_))
    }
}

// Conversion from channel errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ClusterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ClusterError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout
    }
}

impl From<postcard::Error> for ClusterError {
    fn from(e: postcard::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<redb::Error> for ClusterError {
    fn from(e: redb::Error) -> Self {
        ClusterError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(ClusterError::Timeout.is_retriable());
        assert!(ClusterError::SeniorUnavailable.is_retriable());
        assert!(ClusterError::Conflict {
            partition: 1,
            expected: 2,
            actual: 3
        }
        .is_retriable());
        assert!(!ClusterError::DataLoss { partition: 1 }.is_retriable());
        assert!(!ClusterError::ServiceSuspended {
            required: 3,
            live: 2
        }
        .is_retriable());
    }

    #[test]
    fn test_redirect_target() {
        let err = ClusterError::Redirect {
            partition: 7,
            owner: Some(3),
        };
        assert!(err.should_redirect());
        assert_eq!(err.redirect_target(), Some(3));

        let err = ClusterError::Redirect {
            partition: 7,
            owner: None,
        };
        assert!(err.should_redirect());
        assert_eq!(err.redirect_target(), None);
    }

    #[test]
    fn test_surfaced_errors() {
        assert!(ClusterError::DataLoss { partition: 0 }.is_surfaced());
        assert!(ClusterError::ServiceSuspended {
            required: 3,
            live: 1
        }
        .is_surfaced());
        assert!(!ClusterError::SeniorUnavailable.is_surfaced());
    }

    #[test]
    fn test_indeterminate_errors() {
        let err = ClusterError::ReplicationFailed {
            partition: 4,
            backups: vec![2],
        };
        assert!(err.is_retriable());
        assert!(err.is_indeterminate());
        assert!(ClusterError::Timeout.is_indeterminate());
        assert!(!ClusterError::Redirect {
            partition: 4,
            owner: Some(1)
        }
        .is_indeterminate());
        assert!(!ClusterError::MemberUnreachable { member: 2 }.is_indeterminate());
    }
}
