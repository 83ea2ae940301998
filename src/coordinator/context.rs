//! Per-request bookkeeping and quorum policies
//!
//! A [`RequestContext`] tracks one in-flight replicated request: the member
//! set snapshotted at dispatch time, the responses received so far, and the
//! [`ResponseHandler`] that decides when the request is complete and what to
//! report back. Contexts are only touched from the owning database's actor
//! loop, so they carry no synchronization of their own.

use crate::common::{NodeId, OperationId};
use crate::coordinator::log::LogId;
use crate::coordinator::requests::{NodeRequest, NodeResponse, SubmitResponse};
use crate::tx::outcome::TxOutcome;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

/// Completion policy for a replicated request.
///
/// Different request kinds (majority ack, unanimous ack, administrative
/// operations) plug different policies into the same coordinator machinery.
pub trait ResponseHandler: Send {
    /// Is the request complete given what has been received so far?
    fn is_complete(
        &self,
        expected: &HashSet<NodeId>,
        received: &HashMap<NodeId, NodeResponse>,
    ) -> bool;

    /// Aggregate the received responses into the reply for the submitter.
    /// Called exactly once, after `is_complete` first returns true.
    fn on_complete(&mut self, received: &HashMap<NodeId, NodeResponse>) -> SubmitResponse;
}

fn success_count(received: &HashMap<NodeId, NodeResponse>) -> usize {
    received.values().filter(|r| r.is_success()).count()
}

/// First non-success outcome in node-id order, for deterministic reporting
/// across independently aggregating observers.
fn first_failure(received: &HashMap<NodeId, NodeResponse>) -> Option<TxOutcome> {
    let mut nodes: Vec<&NodeId> = received
        .iter()
        .filter(|(_, r)| !r.is_success())
        .map(|(n, _)| n)
        .collect();
    nodes.sort();
    nodes.first().and_then(|n| match &received[*n] {
        NodeResponse::Phase1(outcome) => Some(outcome.clone()),
        NodeResponse::Phase2Ack { .. } => Some(TxOutcome::Failure {
            message: format!("phase 2 rejected by {}", n),
        }),
    })
}

/// Majority-acknowledgement policy: complete once strictly more than
/// `quorum` members report success, or as soon as any member reports a
/// terminal conflict (which is then propagated unchanged), or when every
/// expected member has answered.
pub struct MajorityHandler {
    quorum: usize,
}

impl MajorityHandler {
    pub fn new(quorum: usize) -> Self {
        Self { quorum }
    }
}

impl ResponseHandler for MajorityHandler {
    fn is_complete(
        &self,
        expected: &HashSet<NodeId>,
        received: &HashMap<NodeId, NodeResponse>,
    ) -> bool {
        success_count(received) > self.quorum
            || received.values().any(|r| !r.is_success())
            || (!expected.is_empty() && received.len() == expected.len())
    }

    fn on_complete(&mut self, received: &HashMap<NodeId, NodeResponse>) -> SubmitResponse {
        if success_count(received) > self.quorum {
            SubmitResponse::Tx(TxOutcome::Success)
        } else if let Some(outcome) = first_failure(received) {
            SubmitResponse::Tx(outcome)
        } else {
            SubmitResponse::Timeout
        }
    }
}

/// Unanimous policy for requests that must hold cluster-wide (unique-index
/// transactions): every expected member must report success.
pub struct UnanimousHandler;

impl UnanimousHandler {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self
    }
}

impl ResponseHandler for UnanimousHandler {
    fn is_complete(
        &self,
        expected: &HashSet<NodeId>,
        received: &HashMap<NodeId, NodeResponse>,
    ) -> bool {
        received.values().any(|r| !r.is_success())
            || (!expected.is_empty() && received.len() == expected.len())
    }

    fn on_complete(&mut self, received: &HashMap<NodeId, NodeResponse>) -> SubmitResponse {
        if let Some(outcome) = first_failure(received) {
            SubmitResponse::Tx(outcome)
        } else {
            SubmitResponse::Tx(TxOutcome::Success)
        }
    }
}

/// One in-flight coordinated request.
pub struct RequestContext {
    request_id: LogId,
    requester: NodeId,
    operation_id: OperationId,
    node_request: NodeRequest,
    expected: HashSet<NodeId>,
    received: HashMap<NodeId, NodeResponse>,
    handler: Box<dyn ResponseHandler>,
    deadline: Instant,
    finished: bool,
}

impl RequestContext {
    pub fn new(
        request_id: LogId,
        requester: NodeId,
        operation_id: OperationId,
        node_request: NodeRequest,
        expected: HashSet<NodeId>,
        handler: Box<dyn ResponseHandler>,
        deadline: Instant,
    ) -> Self {
        Self {
            request_id,
            requester,
            operation_id,
            node_request,
            expected,
            received: HashMap::new(),
            handler,
            deadline,
            finished: false,
        }
    }

    /// Record a member's response. Duplicates keep the first answer; a
    /// response from a node outside the dispatch-time snapshot is ignored so
    /// membership changes cannot skew quorum arithmetic.
    pub fn receive(&mut self, member: NodeId, response: NodeResponse) {
        if !self.expected.contains(&member) {
            tracing::debug!(
                request = %self.request_id,
                member = %member,
                "response from node outside the expected set, ignoring"
            );
            return;
        }
        self.received.entry(member).or_insert(response);
    }

    /// Evaluate the completion policy. Returns the aggregated reply the
    /// first time the policy is satisfied, and `None` on every later call.
    pub fn check(&mut self) -> Option<SubmitResponse> {
        if self.finished || !self.handler.is_complete(&self.expected, &self.received) {
            return None;
        }
        self.finished = true;
        Some(self.handler.on_complete(&self.received))
    }

    /// Past its deadline without completing?
    pub fn expired(&self, now: Instant) -> bool {
        !self.finished && now >= self.deadline
    }

    /// Mark abandoned (deadline escalation); further checks return `None`.
    pub fn abandon(&mut self) {
        self.finished = true;
    }

    pub fn request_id(&self) -> LogId {
        self.request_id
    }

    pub fn requester(&self) -> &NodeId {
        &self.requester
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    pub fn node_request(&self) -> &NodeRequest {
        &self.node_request
    }

    pub fn expected(&self) -> &HashSet<NodeId> {
        &self.expected
    }

    pub fn received_len(&self) -> usize {
        self.received.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::task::TransactionTask;
    use std::time::Duration;

    fn members(names: &[&str]) -> HashSet<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn context(expected: HashSet<NodeId>, handler: Box<dyn ResponseHandler>) -> RequestContext {
        RequestContext::new(
            LogId {
                id: 0,
                term: 1,
                previous_term: -1,
            },
            NodeId::from("client"),
            OperationId::new(),
            NodeRequest::TxPhase1(TransactionTask::build(&[], &[])),
            expected,
            handler,
            Instant::now() + Duration::from_secs(60),
        )
    }

    #[test]
    fn test_completion_fires_exactly_once() {
        let mut ctx = context(
            members(&["n1", "n2", "n3"]),
            Box::new(MajorityHandler::new(1)),
        );

        // one success: predicate not yet satisfiable
        ctx.receive(NodeId::from("n1"), NodeResponse::Phase1(TxOutcome::Success));
        assert_eq!(ctx.check(), None);

        // second success crosses the quorum threshold
        ctx.receive(NodeId::from("n2"), NodeResponse::Phase1(TxOutcome::Success));
        assert_eq!(ctx.check(), Some(SubmitResponse::Tx(TxOutcome::Success)));

        // late third ack must not re-fire
        ctx.receive(NodeId::from("n3"), NodeResponse::Phase1(TxOutcome::Success));
        assert_eq!(ctx.check(), None);
    }

    #[test]
    fn test_duplicate_acks_tolerated() {
        let mut ctx = context(
            members(&["n1", "n2", "n3"]),
            Box::new(MajorityHandler::new(1)),
        );

        ctx.receive(NodeId::from("n1"), NodeResponse::Phase1(TxOutcome::Success));
        ctx.receive(NodeId::from("n1"), NodeResponse::Phase1(TxOutcome::Success));
        assert_eq!(ctx.received_len(), 1);
        assert_eq!(ctx.check(), None);
    }

    #[test]
    fn test_conflict_propagates_unchanged() {
        let mut ctx = context(
            members(&["n1", "n2", "n3"]),
            Box::new(MajorityHandler::new(1)),
        );

        let conflict = TxOutcome::ConcurrentModification {
            record: crate::tx::task::RecordId::new(2, 5),
            server_version: 8,
        };
        ctx.receive(NodeId::from("n2"), NodeResponse::Phase1(conflict.clone()));
        assert_eq!(ctx.check(), Some(SubmitResponse::Tx(conflict)));
    }

    #[test]
    fn test_unexpected_member_ignored() {
        let mut ctx = context(members(&["n1", "n2"]), Box::new(MajorityHandler::new(0)));

        ctx.receive(
            NodeId::from("stranger"),
            NodeResponse::Phase1(TxOutcome::Success),
        );
        assert_eq!(ctx.received_len(), 0);
        assert_eq!(ctx.check(), None);
    }

    #[test]
    fn test_unanimous_requires_all() {
        let mut ctx = context(members(&["n1", "n2", "n3"]), Box::new(UnanimousHandler::new()));

        ctx.receive(NodeId::from("n1"), NodeResponse::Phase1(TxOutcome::Success));
        ctx.receive(NodeId::from("n2"), NodeResponse::Phase1(TxOutcome::Success));
        assert_eq!(ctx.check(), None);

        ctx.receive(NodeId::from("n3"), NodeResponse::Phase1(TxOutcome::Success));
        assert_eq!(ctx.check(), Some(SubmitResponse::Tx(TxOutcome::Success)));
    }

    #[test]
    fn test_expiry() {
        let ctx = context(members(&["n1"]), Box::new(MajorityHandler::new(0)));
        assert!(!ctx.expired(Instant::now()));
        assert!(ctx.expired(Instant::now() + Duration::from_secs(120)));
    }
}
