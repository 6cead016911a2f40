//! Membership view
//!
//! Each member keeps a view of the live members, fed by a totally ordered
//! stream of membership events. Every view applies the same events in the
//! same order, so all views agree on the live set, on join order and on
//! which member is senior.

use crate::config::MembershipConfig;
use crate::error::{ClusterError, Result};
use crate::member::{Member, MemberId, MemberInfo};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Membership events delivered by the group transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    /// A member joined the grid
    Joined(MemberInfo),
    /// A member left gracefully
    Left(MemberId),
    /// A member was declared dead by the failure detector
    Failed(MemberId),
}

/// A membership event stamped with its position in the total order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: MembershipEvent,
}

/// Changes to the view, published to local subscribers
#[derive(Debug, Clone)]
pub enum ViewChange {
    MemberJoined(Member),
    MemberDeparted { member: MemberId, failed: bool },
    SeniorChanged {
        previous: Option<MemberId>,
        current: Option<MemberId>,
    },
}

#[derive(Debug, Default)]
struct ViewState {
    members: BTreeMap<MemberId, Member>,
    last_seq: u64,
    next_incarnation: u64,
    senior: Option<MemberId>,
}

/// One member's view of the grid
#[derive(Debug)]
pub struct MembershipView {
    local: MemberId,
    config: MembershipConfig,
    state: RwLock<ViewState>,
    change_tx: broadcast::Sender<ViewChange>,
}

impl MembershipView {
    pub fn new(local: MemberId, config: MembershipConfig) -> Self {
        let (change_tx, _) = broadcast::channel(config.event_buffer.max(16));
        Self {
            local,
            config,
            state: RwLock::new(ViewState::default()),
            change_tx,
        }
    }

    /// Subscribe to view changes
    pub fn subscribe(&self) -> broadcast::Receiver<ViewChange> {
        self.change_tx.subscribe()
    }

    pub fn local_id(&self) -> MemberId {
        self.local
    }

    /// Sequence of the last applied event
    pub fn last_seq(&self) -> u64 {
        self.state.read().last_seq
    }

    /// Apply the next event of the total order.
    ///
    /// Events must arrive with consecutive sequence numbers; an already
    /// applied sequence is ignored and a gap is rejected.
    pub fn apply(&self, event: SequencedEvent) -> Result<Vec<ViewChange>> {
        let mut state = self.state.write();

        if event.seq <= state.last_seq {
            debug!(seq = event.seq, "Ignoring already applied membership event");
            return Ok(Vec::new());
        }
        if event.seq != state.last_seq + 1 {
            return Err(ClusterError::MembershipOutOfOrder {
                expected: state.last_seq + 1,
                received: event.seq,
            });
        }
        state.last_seq = event.seq;

        let previous = state.senior;
        let mut changes = Vec::new();
        let departed = match event.event {
            MembershipEvent::Joined(info) => {
                let id = info.id;
                if state.members.remove(&id).is_some() {
                    // rejoin under the same id: the old incarnation is gone
                    changes.push(ViewChange::MemberDeparted {
                        member: id,
                        failed: true,
                    });
                    if state.senior == Some(id) {
                        state.senior = None;
                    }
                }
                state.next_incarnation += 1;
                let member = Member::new(info, state.next_incarnation, event.seq);
                info!(
                    member = id,
                    incarnation = member.incarnation,
                    view = self.local,
                    "Member joined"
                );
                state.members.insert(id, member.clone());
                changes.push(ViewChange::MemberJoined(member));
                None
            }
            MembershipEvent::Left(id) => Some((id, false)),
            MembershipEvent::Failed(id) => Some((id, true)),
        };

        if let Some((id, failed)) = departed {
            if state.members.remove(&id).is_none() {
                warn!(member = id, "Departure of unknown member");
            } else {
                info!(member = id, failed, view = self.local, "Member departed");
                changes.push(ViewChange::MemberDeparted { member: id, failed });
            }
            if state.senior == Some(id) {
                state.senior = None;
            }
        }

        if state.senior.is_none() {
            state.senior = self.elect_senior(&state);
        }
        if state.senior != previous {
            let current = state.senior;
            info!(?previous, ?current, view = self.local, "Senior member changed");
            changes.push(ViewChange::SeniorChanged { previous, current });
        }
        drop(state);

        for change in &changes {
            // no subscribers is fine
            let _ = self.change_tx.send(change.clone());
        }
        Ok(changes)
    }

    /// Pick the senior among live storage-enabled members: the first in the
    /// succession list, otherwise the lowest (incarnation, id).
    fn elect_senior(&self, state: &ViewState) -> Option<MemberId> {
        let eligible = |id: &MemberId| {
            state
                .members
                .get(id)
                .map(|m| m.is_storage_enabled())
                .unwrap_or(false)
        };

        if let Some(id) = self.config.succession.iter().find(|id| eligible(id)) {
            return Some(*id);
        }

        state
            .members
            .values()
            .filter(|m| m.is_storage_enabled())
            .min_by_key(|m| m.seniority())
            .map(|m| m.id())
    }

    pub fn senior(&self) -> Option<MemberId> {
        self.state.read().senior
    }

    pub fn is_senior(&self) -> bool {
        self.senior() == Some(self.local)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.state.read().members.contains_key(&id)
    }

    pub fn member(&self, id: MemberId) -> Option<Member> {
        self.state.read().members.get(&id).cloned()
    }

    /// All live members ordered by id
    pub fn members(&self) -> Vec<Member> {
        self.state.read().members.values().cloned().collect()
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        self.state.read().members.keys().copied().collect()
    }

    /// Live storage-enabled member ids in ascending order
    pub fn storage_members(&self) -> Vec<MemberId> {
        self.state
            .read()
            .members
            .values()
            .filter(|m| m.is_storage_enabled())
            .map(|m| m.id())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn storage_count(&self) -> usize {
        self.state
            .read()
            .members
            .values()
            .filter(|m| m.is_storage_enabled())
            .count()
    }
}
