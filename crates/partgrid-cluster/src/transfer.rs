//! Partition transfer tasks
//!
//! A transfer moves one replica of a partition to a new member:
//!
//! ```text
//! Scheduled -> DataRequested -> DataSent -> DataAcknowledged -> MapUpdated -> Complete
//!      \____________\______________\______________\___________________\-> Aborted
//! ```
//!
//! The source keeps serving writes until it seals the partition. Writes made
//! after the bulk copy are captured and shipped as a delta, and the map only
//! changes after the destination acknowledged bulk plus delta.

use crate::error::{ClusterError, Result};
use crate::member::MemberId;
use crate::partition::{PartitionId, SequencedMutation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transfer identifier
pub type TransferId = Uuid;

/// Replica slot a transfer fills at the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRole {
    Primary,
    Backup,
}

/// Transfer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Scheduled,
    DataRequested,
    DataSent,
    DataAcknowledged,
    MapUpdated,
    Complete,
    Aborted,
}

impl TransferState {
    /// Successor in the happy path
    pub fn next(&self) -> Option<TransferState> {
        match self {
            TransferState::Scheduled => Some(TransferState::DataRequested),
            TransferState::DataRequested => Some(TransferState::DataSent),
            TransferState::DataSent => Some(TransferState::DataAcknowledged),
            TransferState::DataAcknowledged => Some(TransferState::MapUpdated),
            TransferState::MapUpdated => Some(TransferState::Complete),
            TransferState::Complete | TransferState::Aborted => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Aborted)
    }
}

/// One replica move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: TransferId,
    pub partition: PartitionId,
    /// Member the data is copied from (the current primary)
    pub source: MemberId,
    pub destination: MemberId,
    pub role: TransferRole,
    /// Backup being replaced, if any
    pub replaces: Option<MemberId>,
    pub state: TransferState,
}

impl TransferTask {
    pub fn new(
        partition: PartitionId,
        source: MemberId,
        destination: MemberId,
        role: TransferRole,
        replaces: Option<MemberId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            partition,
            source,
            destination,
            role,
            replaces,
            state: TransferState::Scheduled,
        }
    }

    /// Move to `to`, which must be the next state
    pub fn advance(&mut self, to: TransferState) -> Result<()> {
        if self.state.next() != Some(to) {
            return Err(ClusterError::TransferAborted {
                task: self.id,
                reason: format!("illegal transition {:?} -> {:?}", self.state, to),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Abort unless already terminal; returns whether the state changed
    pub fn abort(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TransferState::Aborted;
        true
    }

    pub fn involves(&self, member: MemberId) -> bool {
        self.source == member || self.destination == member || self.replaces == Some(member)
    }

    /// Whether the ownership map already names the destination
    pub fn map_committed(&self) -> bool {
        matches!(self.state, TransferState::MapUpdated | TransferState::Complete)
    }
}

/// Source-side state of a transfer in progress
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    pub task: TransferId,
    pub destination: MemberId,
    /// Mutations applied after the bulk copy was taken
    pub captured: Vec<SequencedMutation>,
    /// Once sealed the source refuses new writes for the partition
    pub sealed: bool,
}

impl OutgoingTransfer {
    pub fn new(task: TransferId, destination: MemberId) -> Self {
        Self {
            task,
            destination,
            captured: Vec::new(),
            sealed: false,
        }
    }

    pub fn capture(&mut self, mutation: SequencedMutation) {
        self.captured.push(mutation);
    }

    /// Stop accepting writes and hand over everything captured so far
    pub fn seal(&mut self) -> Vec<SequencedMutation> {
        self.sealed = true;
        std::mem::take(&mut self.captured)
    }
}

/// Destination-side state of a transfer in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingTransfer {
    pub task: TransferId,
    pub source: MemberId,
}
