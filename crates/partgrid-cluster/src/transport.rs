//! Member-to-member transport
//!
//! The grid core needs two services from its environment: request/response
//! messaging between members and a totally ordered membership event stream.
//! [`ClusterTransport`] is that seam. [`LocalTransport`] implements it
//! in-process; every request still goes through the wire codec.

use crate::error::{ClusterError, Result};
use crate::member::MemberId;
use crate::membership::{MembershipEvent, MembershipView, SequencedEvent};
use crate::protocol::{
    decode_request, decode_response, encode_request, encode_response, ClusterRequest,
    ClusterResponse, RequestFrame, RequestHeader, ResponseFrame,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Serves requests addressed to one member
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, source: MemberId, request: ClusterRequest) -> ClusterResponse;
}

/// Messaging plus ordered membership delivery
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Register a member's handler and view. The view first receives every
    /// membership event already published.
    fn attach(
        &self,
        member: MemberId,
        handler: Arc<dyn RequestHandler>,
        view: Arc<MembershipView>,
    ) -> Result<()>;

    /// Remove a member; requests to or from it fail afterwards
    fn detach(&self, member: MemberId);

    /// Publish a membership event to every attached view, in one total order
    fn publish(&self, event: MembershipEvent) -> Result<u64>;

    /// Send a request and wait for the response
    async fn send(
        &self,
        from: MemberId,
        to: MemberId,
        request: ClusterRequest,
    ) -> Result<ClusterResponse>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Time to wait for a response
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct GroupState {
    last_seq: u64,
    history: Vec<SequencedEvent>,
    views: BTreeMap<MemberId, Arc<MembershipView>>,
}

/// In-process transport for members running in one process
pub struct LocalTransport {
    config: TransportConfig,
    handlers: DashMap<MemberId, Arc<dyn RequestHandler>>,
    group: Mutex<GroupState>,
    correlation: AtomicU64,
}

impl LocalTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            handlers: DashMap::new(),
            group: Mutex::new(GroupState::default()),
            correlation: AtomicU64::new(1),
        }
    }

    /// Attached member ids
    pub fn members(&self) -> Vec<MemberId> {
        let mut members: Vec<MemberId> = self.handlers.iter().map(|e| *e.key()).collect();
        members.sort_unstable();
        members
    }

    /// Sequence of the last published membership event
    pub fn last_seq(&self) -> u64 {
        self.group.lock().last_seq
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    fn attach(
        &self,
        member: MemberId,
        handler: Arc<dyn RequestHandler>,
        view: Arc<MembershipView>,
    ) -> Result<()> {
        let mut group = self.group.lock();
        for event in &group.history {
            view.apply(event.clone())?;
        }
        group.views.insert(member, view);
        self.handlers.insert(member, handler);
        debug!(member, replayed = group.history.len(), "Member attached");
        Ok(())
    }

    fn detach(&self, member: MemberId) {
        self.handlers.remove(&member);
        self.group.lock().views.remove(&member);
        debug!(member, "Member detached");
    }

    fn publish(&self, event: MembershipEvent) -> Result<u64> {
        let mut group = self.group.lock();
        group.last_seq += 1;
        let sequenced = SequencedEvent {
            seq: group.last_seq,
            event,
        };
        for (member, view) in &group.views {
            if let Err(e) = view.apply(sequenced.clone()) {
                warn!(member, error = %e, "Membership view rejected event");
            }
        }
        let seq = sequenced.seq;
        group.history.push(sequenced);
        Ok(seq)
    }

    async fn send(
        &self,
        from: MemberId,
        to: MemberId,
        request: ClusterRequest,
    ) -> Result<ClusterResponse> {
        if !self.handlers.contains_key(&from) {
            return Err(ClusterError::ShuttingDown);
        }
        let handler = self
            .handlers
            .get(&to)
            .map(|h| h.value().clone())
            .ok_or(ClusterError::MemberUnreachable { member: to })?;

        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed);
        trace!(from, to, correlation_id, kind = request.kind(), "Sending request");

        let bytes = encode_request(&RequestFrame {
            header: RequestHeader::new(correlation_id, from),
            request,
        })?;
        let frame = decode_request(&bytes)?;

        let response = tokio::time::timeout(
            self.config.request_timeout,
            handler.handle(frame.header.source, frame.request),
        )
        .await?;

        let bytes = encode_response(&ResponseFrame {
            correlation_id,
            response,
        })?;
        let frame = decode_response(&bytes)?;
        if frame.correlation_id != correlation_id {
            return Err(ClusterError::Protocol(format!(
                "correlation mismatch: sent {}, got {}",
                correlation_id, frame.correlation_id
            )));
        }
        Ok(frame.response)
    }
}
