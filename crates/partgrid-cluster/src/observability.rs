//! Grid metrics
//!
//! Thin wrappers over the `metrics` facade. With the `metrics` feature
//! disabled every call compiles to nothing; with it enabled, values go to
//! whatever recorder the embedding process installed.
//!
//! ```rust,ignore
//! use partgrid_cluster::observability::{GridMetrics, TransferMetrics};
//!
//! GridMetrics::set_map_version(42);
//! TransferMetrics::increment_completed();
//! ```

use std::time::Duration;

// ============================================================================
// Grid Metrics
// ============================================================================

/// Membership and ownership metrics
pub struct GridMetrics;

impl GridMetrics {
    /// Live members in the local view
    pub fn set_member_count(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("partgrid_members").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    /// Live storage-enabled members in the local view
    pub fn set_storage_member_count(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("partgrid_storage_members").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    /// Version of the locally installed ownership map
    pub fn set_map_version(version: u64) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("partgrid_map_version").set(version as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = version;
    }

    /// Partitions with no primary
    pub fn set_orphaned_partitions(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("partgrid_orphaned_partitions").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    /// Partitions with fewer backups than configured
    pub fn set_under_replicated_partitions(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("partgrid_under_replicated_partitions").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    /// Partitions declared lost
    pub fn increment_data_loss() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_data_loss_total").increment(1);
    }

    /// Compare-and-set attempts that lost against a newer map entry
    pub fn increment_map_conflicts() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_map_conflicts_total").increment(1);
    }

    /// Requests answered with a redirect
    pub fn increment_redirects() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_redirects_total").increment(1);
    }

    /// Requests refused for lack of quorum
    pub fn increment_suspended_requests() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_suspended_requests_total").increment(1);
    }

    /// Rebalance rounds run by the senior
    pub fn increment_rebalance_rounds() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_rebalance_rounds_total").increment(1);
    }
}

// ============================================================================
// Transfer Metrics
// ============================================================================

/// Partition transfer metrics
pub struct TransferMetrics;

impl TransferMetrics {
    pub fn increment_started() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_transfers_started_total").increment(1);
    }

    pub fn increment_completed() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_transfers_completed_total").increment(1);
    }

    pub fn increment_aborted() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_transfers_aborted_total").increment(1);
    }

    /// Time from scheduling to completion
    pub fn record_duration(duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("partgrid_transfer_duration_seconds").record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = duration;
    }

    /// Entries shipped in a bulk copy
    pub fn record_bulk_entries(entries: usize) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("partgrid_transfer_bulk_entries").record(entries as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = entries;
    }
}

// ============================================================================
// Replication Metrics
// ============================================================================

/// Backup replication metrics
pub struct ReplicationMetrics;

impl ReplicationMetrics {
    pub fn increment_sent() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_replication_sent_total").increment(1);
    }

    /// Full-partition resyncs after a gap or a missing replica
    pub fn increment_resyncs() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_replication_resyncs_total").increment(1);
    }

    pub fn increment_failures() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_replication_failures_total").increment(1);
    }

    /// Time for all backups to acknowledge a synchronous write
    pub fn record_ack_latency(duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("partgrid_replication_ack_latency_seconds")
            .record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = duration;
    }
}

// ============================================================================
// Persistence Metrics
// ============================================================================

/// Persistence metrics
pub struct PersistenceMetrics;

impl PersistenceMetrics {
    pub fn increment_active_writes() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_persistence_active_writes_total").increment(1);
    }

    pub fn increment_snapshots() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_persistence_snapshots_total").increment(1);
    }

    pub fn increment_recoveries() {
        #[cfg(feature = "metrics")]
        metrics::counter!("partgrid_persistence_recoveries_total").increment(1);
    }

    pub fn record_snapshot_duration(duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("partgrid_persistence_snapshot_duration_seconds")
            .record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = duration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder() {
        // no recorder installed: every call is a no-op
        GridMetrics::set_member_count(3);
        GridMetrics::set_map_version(7);
        GridMetrics::increment_data_loss();
        TransferMetrics::increment_started();
        TransferMetrics::record_duration(Duration::from_millis(5));
        ReplicationMetrics::record_ack_latency(Duration::from_micros(200));
        PersistenceMetrics::increment_snapshots();
    }
}
