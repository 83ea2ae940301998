//! Network seam
//!
//! The coordinator never talks to a transport directly; it goes through
//! [`NetworkSender`]. Message framing below the field layouts in
//! [`crate::coordinator::wire`] belongs to the transport crate. The
//! in-memory [`ChannelNetwork`] wires nodes together with tokio channels and
//! backs local clusters and tests.

use crate::common::{NodeId, OperationId};
use crate::coordinator::log::LogId;
use crate::coordinator::requests::{NodeRequest, Operation, SubmitResponse};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Outbound sending capability consumed by the coordination core.
pub trait NetworkSender: Send + Sync {
    /// Fan a replicated operation out to the given members.
    fn send_request(&self, members: &[NodeId], database: &str, id: LogId, request: &NodeRequest);

    /// Route a submit outcome back to the original submitter.
    fn reply(
        &self,
        member: &NodeId,
        database: &str,
        operation_id: &OperationId,
        response: &SubmitResponse,
    );

    /// Send node-to-node election traffic.
    fn send_operation(&self, member: &NodeId, database: &str, operation: &Operation);
}

/// Something delivered to a node by the network.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Request {
        database: String,
        id: LogId,
        request: NodeRequest,
    },
    Reply {
        database: String,
        operation_id: OperationId,
        response: SubmitResponse,
    },
    Operation {
        database: String,
        operation: Operation,
    },
}

/// In-memory network: every registered node gets an unbounded mailbox.
/// Sends to unknown members are dropped with a warning, mirroring a
/// transport that lost the peer.
#[derive(Default)]
pub struct ChannelNetwork {
    mailboxes: Mutex<HashMap<NodeId, mpsc::UnboundedSender<Delivery>>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, returning its mailbox receiver.
    pub fn register(&self, node: NodeId) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.lock().unwrap().insert(node, tx);
        rx
    }

    fn deliver(&self, member: &NodeId, delivery: Delivery) {
        let mailboxes = self.mailboxes.lock().unwrap();
        match mailboxes.get(member) {
            Some(tx) => {
                if tx.send(delivery).is_err() {
                    tracing::warn!(member = %member, "mailbox closed, dropping delivery");
                }
            }
            None => {
                tracing::warn!(member = %member, "unknown member, dropping delivery");
            }
        }
    }
}

impl NetworkSender for ChannelNetwork {
    fn send_request(&self, members: &[NodeId], database: &str, id: LogId, request: &NodeRequest) {
        for member in members {
            self.deliver(
                member,
                Delivery::Request {
                    database: database.to_string(),
                    id,
                    request: request.clone(),
                },
            );
        }
    }

    fn reply(
        &self,
        member: &NodeId,
        database: &str,
        operation_id: &OperationId,
        response: &SubmitResponse,
    ) {
        self.deliver(
            member,
            Delivery::Reply {
                database: database.to_string(),
                operation_id: operation_id.clone(),
                response: response.clone(),
            },
        );
    }

    fn send_operation(&self, member: &NodeId, database: &str, operation: &Operation) {
        self.deliver(
            member,
            Delivery::Operation {
                database: database.to_string(),
                operation: operation.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::task::TransactionTask;

    #[tokio::test]
    async fn test_fan_out() {
        let net = ChannelNetwork::new();
        let mut rx1 = net.register(NodeId::from("n1"));
        let mut rx2 = net.register(NodeId::from("n2"));

        let id = LogId {
            id: 0,
            term: 1,
            previous_term: -1,
        };
        let request = NodeRequest::TxPhase1(TransactionTask::build(&[], &[]));
        net.send_request(
            &[NodeId::from("n1"), NodeId::from("n2")],
            "db1",
            id,
            &request,
        );

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                Delivery::Request {
                    database,
                    id: got,
                    request: got_req,
                } => {
                    assert_eq!(database, "db1");
                    assert_eq!(got, id);
                    assert_eq!(got_req, request);
                }
                other => panic!("unexpected delivery: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_member_dropped() {
        let net = ChannelNetwork::new();
        // must not panic
        net.send_operation(
            &NodeId::from("ghost"),
            "db1",
            &Operation::LastOpIdRequest {
                database: "db1".into(),
                term: 1,
            },
        );
    }
}
