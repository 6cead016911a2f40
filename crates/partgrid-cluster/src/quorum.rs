//! Quorum policy
//!
//! Gates serving, partition movement, loss declaration and recovery on the
//! number of live storage-enabled members.

use crate::config::QuorumConfig;
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};

/// Operations guarded by a quorum threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumGate {
    /// Serving requests and moving partitions
    Service,
    /// Declaring a partition lost
    LossAcknowledgement,
    /// Starting the first distribution or recovery from persistence
    Recovery,
}

/// Externally visible service state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Ownership map is installed and quorum holds
    Running,
    /// Quorum holds but the first distribution or recovery has not finished
    Recovering,
    /// Too few storage members; requests are refused, nothing moves
    Suspended,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Recovering => "recovering",
            ServiceStatus::Suspended => "suspended",
        }
    }
}

/// Quorum thresholds applied to a live storage-member count
#[derive(Debug, Clone)]
pub struct QuorumPolicy {
    config: QuorumConfig,
}

impl QuorumPolicy {
    pub fn new(config: QuorumConfig) -> Self {
        Self { config }
    }

    pub fn threshold(&self, gate: QuorumGate) -> usize {
        match gate {
            QuorumGate::Service => self.config.service_quorum,
            QuorumGate::LossAcknowledgement => self.config.loss_quorum,
            QuorumGate::Recovery => self.config.recovery_quorum,
        }
    }

    pub fn allows(&self, gate: QuorumGate, live_storage: usize) -> bool {
        live_storage >= self.threshold(gate)
    }

    /// Fail with `ServiceSuspended` when `gate` is not satisfied
    pub fn check(&self, gate: QuorumGate, live_storage: usize) -> Result<()> {
        let required = self.threshold(gate);
        if live_storage < required {
            return Err(ClusterError::ServiceSuspended {
                required,
                live: live_storage,
            });
        }
        Ok(())
    }

    pub fn status(&self, live_storage: usize, map_initialized: bool) -> ServiceStatus {
        if !self.allows(QuorumGate::Service, live_storage) {
            ServiceStatus::Suspended
        } else if !map_initialized {
            ServiceStatus::Recovering
        } else {
            ServiceStatus::Running
        }
    }
}
