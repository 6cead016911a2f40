//! Partition placement and rebalance planning
//!
//! Pure functions over a map snapshot and the live storage members:
//! - round-robin first distribution
//! - repair of ownership held by departed members
//! - greedy balancing that moves one partition at a time from the most
//!   loaded member to the least loaded one
//!
//! Plans never place two replicas of a partition on the same member.

use crate::member::MemberId;
use crate::partition::PartitionId;
use crate::partition_map::{MapSnapshot, PartitionOwnership};
use crate::transfer::TransferRole;
use std::collections::{BTreeMap, HashSet};

/// A map-only fix for ownership held by departed members
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// Primary departed; a live backup takes over
    Promote {
        partition: PartitionId,
        member: MemberId,
    },
    /// Backup departed
    DropBackup {
        partition: PartitionId,
        member: MemberId,
    },
    /// Primary departed and no live backup exists
    Orphan { partition: PartitionId },
}

impl Repair {
    pub fn partition(&self) -> PartitionId {
        match self {
            Repair::Promote { partition, .. }
            | Repair::DropBackup { partition, .. }
            | Repair::Orphan { partition } => *partition,
        }
    }
}

/// A replica move that needs a data transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTransfer {
    pub partition: PartitionId,
    pub source: MemberId,
    pub destination: MemberId,
    pub role: TransferRole,
    pub replaces: Option<MemberId>,
}

/// Output of one planning round
#[derive(Debug, Clone, Default)]
pub struct RebalancePlan {
    /// Map-only changes, applied before any transfer
    pub repairs: Vec<Repair>,
    /// Partitions with no live copy
    pub orphaned: Vec<PartitionId>,
    /// Data moves, at most one per partition
    pub transfers: Vec<PlannedTransfer>,
    /// Partitions that still have fewer backups than configured
    pub under_replicated: Vec<PartitionId>,
}

impl RebalancePlan {
    /// Nothing to change in the map or move
    pub fn is_empty(&self) -> bool {
        self.repairs.is_empty() && self.orphaned.is_empty() && self.transfers.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Slot {
    primary: Option<MemberId>,
    backups: Vec<MemberId>,
}

impl Slot {
    fn holds(&self, member: MemberId) -> bool {
        self.primary == Some(member) || self.backups.contains(&member)
    }
}

/// Per-member replica counts for the working copy of a plan
#[derive(Debug, Default)]
struct Loads {
    primaries: BTreeMap<MemberId, usize>,
    backups: BTreeMap<MemberId, usize>,
}

impl Loads {
    fn new(members: &[MemberId], slots: &[Option<Slot>]) -> Self {
        let mut loads = Loads::default();
        for member in members {
            loads.primaries.insert(*member, 0);
            loads.backups.insert(*member, 0);
        }
        for slot in slots.iter().flatten() {
            if let Some(primary) = slot.primary {
                *loads.primaries.entry(primary).or_insert(0) += 1;
            }
            for backup in &slot.backups {
                *loads.backups.entry(*backup).or_insert(0) += 1;
            }
        }
        loads
    }

    fn total(&self, member: MemberId) -> usize {
        self.primaries.get(&member).copied().unwrap_or(0)
            + self.backups.get(&member).copied().unwrap_or(0)
    }

    fn adjust(counts: &mut BTreeMap<MemberId, usize>, member: MemberId, delta: isize) {
        let entry = counts.entry(member).or_insert(0);
        *entry = (*entry as isize + delta).max(0) as usize;
    }
}

/// Members ordered by (load, id) ascending
fn by_load(counts: &BTreeMap<MemberId, usize>) -> Vec<(MemberId, usize)> {
    let mut ordered: Vec<(MemberId, usize)> = counts.iter().map(|(m, c)| (*m, *c)).collect();
    ordered.sort_by_key(|(m, c)| (*c, *m));
    ordered
}

/// Partition distribution statistics
#[derive(Debug, Clone, Default)]
pub struct DistributionStats {
    pub member_count: usize,
    pub total_primaries: usize,
    pub total_backups: usize,
    pub primary_min: usize,
    pub primary_max: usize,
    pub primary_avg: f64,
    pub backup_min: usize,
    pub backup_max: usize,
    pub backup_avg: f64,
    pub orphaned: usize,
    pub lost: usize,
}

impl DistributionStats {
    /// Primary counts differ by at most one across members
    pub fn is_balanced(&self) -> bool {
        self.primary_max - self.primary_min <= 1
    }
}

/// Computes distributions and rebalance plans
#[derive(Debug, Clone)]
pub struct PartitionPlacer {
    backup_count: usize,
}

impl PartitionPlacer {
    pub fn new(backup_count: usize) -> Self {
        Self { backup_count }
    }

    /// Backups per partition achievable with `member_count` storage members
    pub fn effective_backups(&self, member_count: usize) -> usize {
        self.backup_count.min(member_count.saturating_sub(1))
    }

    /// First distribution: primaries round-robin over the members, backups
    /// on the members that follow the primary.
    pub fn initial_distribution(
        &self,
        members: &[MemberId],
        partition_count: u32,
    ) -> Vec<PartitionOwnership> {
        let n = members.len();
        let backups = self.effective_backups(n);
        (0..partition_count as usize)
            .map(|p| {
                if n == 0 {
                    return PartitionOwnership::default();
                }
                PartitionOwnership::new(
                    Some(members[p % n]),
                    (1..=backups).map(|i| members[(p + i) % n]).collect(),
                )
            })
            .collect()
    }

    /// Plan the next round of changes.
    ///
    /// `members` are the live storage-enabled members; partitions in `busy`
    /// already have a transfer in flight and get no new transfer.
    pub fn plan(
        &self,
        snapshot: &MapSnapshot,
        members: &[MemberId],
        busy: &HashSet<PartitionId>,
    ) -> RebalancePlan {
        let mut plan = RebalancePlan::default();
        let live: HashSet<MemberId> = members.iter().copied().collect();
        let mut busy = busy.clone();

        // lost partitions stay out of the working copy
        let mut slots: Vec<Option<Slot>> = snapshot
            .partitions
            .iter()
            .enumerate()
            .map(|(p, entry)| {
                if snapshot.lost.contains(&(p as PartitionId)) {
                    None
                } else {
                    Some(Slot {
                        primary: entry.primary,
                        backups: entry.backups.clone(),
                    })
                }
            })
            .collect();

        // ==================== Repairs ====================
        for (p, slot) in slots.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            let partition = p as PartitionId;

            let dead: Vec<MemberId> = slot
                .backups
                .iter()
                .copied()
                .filter(|b| !live.contains(b))
                .collect();
            for member in dead {
                plan.repairs.push(Repair::DropBackup { partition, member });
                slot.backups.retain(|b| *b != member);
            }

            let primary_live = slot.primary.map(|m| live.contains(&m)).unwrap_or(false);
            if primary_live {
                continue;
            }
            if !slot.backups.is_empty() {
                let member = slot.backups.remove(0);
                plan.repairs.push(Repair::Promote { partition, member });
                slot.primary = Some(member);
            } else {
                if slot.primary.is_some() {
                    plan.repairs.push(Repair::Orphan { partition });
                }
                slot.primary = None;
                plan.orphaned.push(partition);
            }
        }

        if members.is_empty() {
            return plan;
        }

        let target = self.effective_backups(members.len());
        let mut loads = Loads::new(members, &slots);

        // ==================== Fill missing backups ====================
        for (p, slot) in slots.iter_mut().enumerate() {
            let partition = p as PartitionId;
            let Some(slot) = slot else { continue };
            let Some(primary) = slot.primary else { continue };
            if busy.contains(&partition) || slot.backups.len() >= target {
                continue;
            }

            let candidate = members
                .iter()
                .copied()
                .filter(|m| !slot.holds(*m))
                .min_by_key(|m| (loads.backups.get(m).copied().unwrap_or(0), loads.total(*m), *m));
            if let Some(destination) = candidate {
                plan.transfers.push(PlannedTransfer {
                    partition,
                    source: primary,
                    destination,
                    role: TransferRole::Backup,
                    replaces: None,
                });
                slot.backups.push(destination);
                Loads::adjust(&mut loads.backups, destination, 1);
                busy.insert(partition);
            }
        }

        // ==================== Balance primaries ====================
        loop {
            let ordered = by_load(&loads.primaries);
            let mut chosen = None;

            'pairs: for (over, over_load) in ordered.iter().rev() {
                for (under, under_load) in ordered.iter() {
                    if over_load <= &(under_load + 1) {
                        break;
                    }
                    let mut swap = None;
                    for (p, slot) in slots.iter().enumerate() {
                        let partition = p as PartitionId;
                        let Some(slot) = slot else { continue };
                        if slot.primary != Some(*over) || busy.contains(&partition) {
                            continue;
                        }
                        if !slot.holds(*under) {
                            chosen = Some((partition, *over, *under, false));
                            break 'pairs;
                        }
                        if swap.is_none() {
                            swap = Some(partition);
                        }
                    }
                    if let Some(partition) = swap {
                        chosen = Some((partition, *over, *under, true));
                        break 'pairs;
                    }
                }
            }

            let Some((partition, source, destination, swap)) = chosen else { break };
            if let Some(slot) = slots[partition as usize].as_mut() {
                slot.primary = Some(destination);
                if swap {
                    if let Some(b) = slot.backups.iter_mut().find(|b| **b == destination) {
                        *b = source;
                    }
                    Loads::adjust(&mut loads.backups, destination, -1);
                    Loads::adjust(&mut loads.backups, source, 1);
                }
            }
            Loads::adjust(&mut loads.primaries, source, -1);
            Loads::adjust(&mut loads.primaries, destination, 1);
            busy.insert(partition);
            plan.transfers.push(PlannedTransfer {
                partition,
                source,
                destination,
                role: TransferRole::Primary,
                replaces: None,
            });
        }

        // ==================== Balance backups ====================
        loop {
            let ordered = by_load(&loads.backups);
            let mut chosen = None;

            'pairs: for (over, over_load) in ordered.iter().rev() {
                for (under, under_load) in ordered.iter() {
                    if over_load <= &(under_load + 1) {
                        break;
                    }
                    for (p, slot) in slots.iter().enumerate() {
                        let partition = p as PartitionId;
                        let Some(slot) = slot else { continue };
                        let Some(primary) = slot.primary else { continue };
                        if busy.contains(&partition)
                            || !slot.backups.contains(over)
                            || slot.holds(*under)
                        {
                            continue;
                        }
                        chosen = Some((partition, primary, *over, *under));
                        break 'pairs;
                    }
                }
            }

            let Some((partition, source, replaced, destination)) = chosen else { break };
            if let Some(slot) = slots[partition as usize].as_mut() {
                if let Some(b) = slot.backups.iter_mut().find(|b| **b == replaced) {
                    *b = destination;
                }
            }
            Loads::adjust(&mut loads.backups, replaced, -1);
            Loads::adjust(&mut loads.backups, destination, 1);
            busy.insert(partition);
            plan.transfers.push(PlannedTransfer {
                partition,
                source,
                destination,
                role: TransferRole::Backup,
                replaces: Some(replaced),
            });
        }

        plan.under_replicated = slots
            .iter()
            .enumerate()
            .filter_map(|(p, slot)| match slot {
                Some(slot) if slot.primary.is_some() && slot.backups.len() < self.backup_count => {
                    Some(p as PartitionId)
                }
                _ => None,
            })
            .collect();

        plan
    }

    /// Distribution statistics for `members` under `snapshot`
    pub fn stats(&self, snapshot: &MapSnapshot, members: &[MemberId]) -> DistributionStats {
        let primaries = snapshot.primary_counts();
        let backups = snapshot.backup_counts();

        let mut primary_counts: Vec<usize> = members
            .iter()
            .map(|m| primaries.get(m).copied().unwrap_or(0))
            .collect();
        let mut backup_counts: Vec<usize> = members
            .iter()
            .map(|m| backups.get(m).copied().unwrap_or(0))
            .collect();
        primary_counts.sort();
        backup_counts.sort();

        let total_primaries: usize = primary_counts.iter().sum();
        let total_backups: usize = backup_counts.iter().sum();
        let n = members.len();

        DistributionStats {
            member_count: n,
            total_primaries,
            total_backups,
            primary_min: primary_counts.first().copied().unwrap_or(0),
            primary_max: primary_counts.last().copied().unwrap_or(0),
            primary_avg: if n == 0 {
                0.0
            } else {
                total_primaries as f64 / n as f64
            },
            backup_min: backup_counts.first().copied().unwrap_or(0),
            backup_max: backup_counts.last().copied().unwrap_or(0),
            backup_avg: if n == 0 {
                0.0
            } else {
                total_backups as f64 / n as f64
            },
            orphaned: snapshot
                .partitions
                .iter()
                .enumerate()
                .filter(|(p, e)| e.primary.is_none() && !snapshot.lost.contains(&(*p as PartitionId)))
                .count(),
            lost: snapshot.lost.len(),
        }
    }
}
