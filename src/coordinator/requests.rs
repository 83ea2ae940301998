//! Coordination message families
//!
//! Requests and responses are closed enums dispatched by `match`, one
//! `begin`/`apply` entry point per variant:
//!
//! - [`SubmitRequest`]: client-facing submissions entering a coordinator.
//! - [`NodeRequest`] / [`NodeResponse`]: replicated operations fanned out to
//!   members and their acknowledgements.
//! - [`SubmitResponse`]: the aggregated result sent back to the submitter.
//! - [`Operation`]: node-to-node election traffic, applied outside any
//!   coordinator context.
//!
//! Every wire-visible variant has a stable opcode and a bit-exact
//! serialize/deserialize pair (see [`crate::coordinator::wire`]).

use crate::common::{NodeId, OperationId, Result};
use crate::coordinator::context::{MajorityHandler, ResponseHandler, UnanimousHandler};
use crate::coordinator::coordinator::CoordinatorState;
use crate::coordinator::election::ElectionContext;
use crate::coordinator::log::LogId;
use crate::coordinator::wire;
use crate::tx::outcome::TxOutcome;
use crate::tx::task::{QuorumType, RecordId, TransactionTask};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A client-submitted request entering the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitRequest {
    /// Replicate a transaction to the cluster.
    Transaction(TransactionTask),
    /// Catch-up request from a rejoining or behind member: resend from the
    /// given position, or hand over a full copy when no position is known.
    Sync { from: Option<LogId> },
}

impl SubmitRequest {
    /// Per-variant entry point, executed on the owning database's serialized
    /// context. Decides whether the request becomes a replicated operation.
    pub fn begin(self, requester: NodeId, operation_id: OperationId, state: &mut CoordinatorState) {
        match self {
            SubmitRequest::Transaction(task) => {
                let handler: Box<dyn ResponseHandler> = match task.quorum_type() {
                    QuorumType::Write => Box::new(MajorityHandler::new(state.members_len() / 2)),
                    QuorumType::All => Box::new(UnanimousHandler::new()),
                };
                let timeout = task.distributed_timeout(state.config().base_timeout());
                state.send_operation(
                    requester,
                    operation_id,
                    NodeRequest::TxPhase1(task),
                    handler,
                    timeout,
                );
            }
            SubmitRequest::Sync { from } => {
                match from {
                    Some(position) => state.try_resend(&requester, position),
                    None => state.send_full_sync(&requester),
                }
                state.reply(&requester, &operation_id, &SubmitResponse::Synced);
            }
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            SubmitRequest::Transaction(task) => {
                buf.put_u8(wire::OP_TX_SUBMIT);
                task.encode_into(&mut buf);
            }
            SubmitRequest::Sync { from } => {
                buf.put_u8(wire::OP_SYNC_REQUEST);
                wire::put_flagged_log_id(&mut buf, *from);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        match wire::get_u8(buf)? {
            wire::OP_TX_SUBMIT => Ok(SubmitRequest::Transaction(TransactionTask::decode(buf)?)),
            wire::OP_SYNC_REQUEST => Ok(SubmitRequest::Sync {
                from: wire::get_flagged_log_id(buf)?,
            }),
            other => Err(crate::Error::Wire(format!(
                "unknown submit request opcode: {}",
                other
            ))),
        }
    }
}

/// A replicated operation sent to every snapshotted member.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRequest {
    TxPhase1(TransactionTask),
    TxPhase2 {
        operation_id: OperationId,
        commit: bool,
    },
}

impl NodeRequest {
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            NodeRequest::TxPhase1(task) => {
                buf.put_u8(wire::OP_TX_PHASE1);
                task.encode_into(buf);
            }
            NodeRequest::TxPhase2 {
                operation_id,
                commit,
            } => {
                buf.put_u8(wire::OP_TX_PHASE2);
                wire::put_utf(buf, &operation_id.to_string())?;
                buf.put_u8(u8::from(*commit));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        match wire::get_u8(buf)? {
            wire::OP_TX_PHASE1 => Ok(NodeRequest::TxPhase1(TransactionTask::decode(buf)?)),
            wire::OP_TX_PHASE2 => {
                let operation_id = OperationId::parse(&wire::get_utf(buf)?)?;
                let commit = wire::get_u8(buf)? == 1;
                Ok(NodeRequest::TxPhase2 {
                    operation_id,
                    commit,
                })
            }
            other => Err(crate::Error::Wire(format!(
                "unknown node request opcode: {}",
                other
            ))),
        }
    }
}

/// A member's acknowledgement of a replicated operation.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeResponse {
    Phase1(TxOutcome),
    Phase2Ack { success: bool },
}

// TxOutcome wire tags
const TX_SUCCESS: u8 = 1;
const TX_CONCURRENT_MODIFICATION: u8 = 2;
const TX_RECORD_LOCK_TIMEOUT: u8 = 3;
const TX_KEY_LOCK_TIMEOUT: u8 = 4;
const TX_UNIQUE_INDEX: u8 = 5;
const TX_CONCURRENT_CREATION: u8 = 6;
const TX_FAILURE: u8 = 7;

fn put_record_id(buf: &mut BytesMut, id: RecordId) {
    buf.put_i32(id.cluster);
    buf.put_i64(id.position);
}

fn get_record_id(buf: &mut impl Buf) -> Result<RecordId> {
    Ok(RecordId::new(wire::get_i32(buf)?, wire::get_i64(buf)?))
}

impl NodeResponse {
    pub fn is_success(&self) -> bool {
        match self {
            NodeResponse::Phase1(outcome) => outcome.is_success(),
            NodeResponse::Phase2Ack { success } => *success,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            NodeResponse::Phase1(outcome) => {
                buf.put_u8(wire::OP_TX_PHASE1);
                match outcome {
                    TxOutcome::Success => buf.put_u8(TX_SUCCESS),
                    TxOutcome::ConcurrentModification {
                        record,
                        server_version,
                    } => {
                        buf.put_u8(TX_CONCURRENT_MODIFICATION);
                        put_record_id(&mut buf, *record);
                        buf.put_i32(*server_version);
                    }
                    TxOutcome::RecordLockTimeout { node, record } => {
                        buf.put_u8(TX_RECORD_LOCK_TIMEOUT);
                        wire::put_utf(&mut buf, node.as_str())?;
                        put_record_id(&mut buf, *record);
                    }
                    TxOutcome::KeyLockTimeout { node, key } => {
                        buf.put_u8(TX_KEY_LOCK_TIMEOUT);
                        wire::put_utf(&mut buf, node.as_str())?;
                        wire::put_utf(&mut buf, key)?;
                    }
                    TxOutcome::UniqueIndexViolation { record, index, key } => {
                        buf.put_u8(TX_UNIQUE_INDEX);
                        put_record_id(&mut buf, *record);
                        wire::put_utf(&mut buf, index)?;
                        wire::put_utf(&mut buf, key)?;
                    }
                    TxOutcome::ConcurrentCreation { actual, expected } => {
                        buf.put_u8(TX_CONCURRENT_CREATION);
                        put_record_id(&mut buf, *actual);
                        put_record_id(&mut buf, *expected);
                    }
                    TxOutcome::Failure { message } => {
                        buf.put_u8(TX_FAILURE);
                        wire::put_utf(&mut buf, message)?;
                    }
                }
            }
            NodeResponse::Phase2Ack { success } => {
                buf.put_u8(wire::OP_TX_PHASE2);
                buf.put_u8(u8::from(*success));
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        match wire::get_u8(buf)? {
            wire::OP_TX_PHASE1 => {
                let outcome = match wire::get_u8(buf)? {
                    TX_SUCCESS => TxOutcome::Success,
                    TX_CONCURRENT_MODIFICATION => TxOutcome::ConcurrentModification {
                        record: get_record_id(buf)?,
                        server_version: wire::get_i32(buf)?,
                    },
                    TX_RECORD_LOCK_TIMEOUT => TxOutcome::RecordLockTimeout {
                        node: NodeId::new(wire::get_utf(buf)?),
                        record: get_record_id(buf)?,
                    },
                    TX_KEY_LOCK_TIMEOUT => TxOutcome::KeyLockTimeout {
                        node: NodeId::new(wire::get_utf(buf)?),
                        key: wire::get_utf(buf)?,
                    },
                    TX_UNIQUE_INDEX => TxOutcome::UniqueIndexViolation {
                        record: get_record_id(buf)?,
                        index: wire::get_utf(buf)?,
                        key: wire::get_utf(buf)?,
                    },
                    TX_CONCURRENT_CREATION => TxOutcome::ConcurrentCreation {
                        actual: get_record_id(buf)?,
                        expected: get_record_id(buf)?,
                    },
                    TX_FAILURE => TxOutcome::Failure {
                        message: wire::get_utf(buf)?,
                    },
                    other => {
                        return Err(crate::Error::Wire(format!(
                            "unknown transaction outcome tag: {}",
                            other
                        )))
                    }
                };
                Ok(NodeResponse::Phase1(outcome))
            }
            wire::OP_TX_PHASE2 => Ok(NodeResponse::Phase2Ack {
                success: wire::get_u8(buf)? == 1,
            }),
            other => Err(crate::Error::Wire(format!(
                "unknown node response opcode: {}",
                other
            ))),
        }
    }
}

/// Aggregated result of a submission, routed back to the submitter.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResponse {
    /// Terminal transaction outcome under the request's quorum policy.
    Tx(TxOutcome),
    /// Quorum was not reached before the request's deadline.
    Timeout,
    /// A sync request was served (resend or full copy dispatched).
    Synced,
}

/// Node-to-node election traffic: last-log-position probes and their
/// replies, term-scoped.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    LastOpIdRequest {
        database: String,
        term: i32,
    },
    LastOpIdResponse {
        database: String,
        term: i32,
        id: Option<LogId>,
    },
}

/// Node-level collaborators an [`Operation`] needs when applied: the local
/// operation logs, the election table, and a way to send a reply back.
pub trait NodeContext {
    fn last_persistent_log(&self, database: &str) -> Option<LogId>;
    fn elections(&self) -> &ElectionContext;
    fn send(&self, target: &NodeId, operation: Operation);
}

impl Operation {
    /// Apply an incoming operation on the receiving node.
    pub fn apply(self, sender: NodeId, ctx: &dyn NodeContext) {
        match self {
            Operation::LastOpIdRequest { database, term } => {
                let id = ctx.last_persistent_log(&database);
                ctx.send(
                    &sender,
                    Operation::LastOpIdResponse { database, term, id },
                );
            }
            Operation::LastOpIdResponse { database, term, id } => {
                let _decided = ctx.elections().received(sender, &database, term as i64, id);
            }
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Operation::LastOpIdRequest { database, term } => {
                buf.put_u8(wire::OP_LAST_OPID_REQUEST);
                wire::put_utf(&mut buf, database)?;
                buf.put_i32(*term);
            }
            Operation::LastOpIdResponse { database, term, id } => {
                buf.put_u8(wire::OP_LAST_OPID_RESPONSE);
                wire::put_utf(&mut buf, database)?;
                buf.put_i32(*term);
                wire::put_flagged_log_id(&mut buf, *id);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        match wire::get_u8(buf)? {
            wire::OP_LAST_OPID_REQUEST => Ok(Operation::LastOpIdRequest {
                database: wire::get_utf(buf)?,
                term: wire::get_i32(buf)?,
            }),
            wire::OP_LAST_OPID_RESPONSE => Ok(Operation::LastOpIdResponse {
                database: wire::get_utf(buf)?,
                term: wire::get_i32(buf)?,
                id: wire::get_flagged_log_id(buf)?,
            }),
            other => Err(crate::Error::Wire(format!(
                "unknown operation opcode: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_operation(op: Operation) {
        let bytes = op.encode().unwrap();
        let mut read = bytes.clone();
        assert_eq!(Operation::decode(&mut read).unwrap(), op);
        assert_eq!(read.remaining(), 0);
    }

    #[test]
    fn test_last_opid_request_roundtrip() {
        roundtrip_operation(Operation::LastOpIdRequest {
            database: "db1".into(),
            term: 3,
        });
    }

    #[test]
    fn test_last_opid_response_roundtrip() {
        roundtrip_operation(Operation::LastOpIdResponse {
            database: "db1".into(),
            term: 3,
            id: Some(LogId {
                id: 10,
                term: 3,
                previous_term: 2,
            }),
        });
        roundtrip_operation(Operation::LastOpIdResponse {
            database: "db1".into(),
            term: 3,
            id: None,
        });
    }

    #[test]
    fn test_sync_request_roundtrip() {
        for from in [
            None,
            Some(LogId {
                id: 5,
                term: 1,
                previous_term: 1,
            }),
        ] {
            let req = SubmitRequest::Sync { from };
            let bytes = req.encode().unwrap();
            let mut read = bytes.clone();
            assert_eq!(SubmitRequest::decode(&mut read).unwrap(), req);
        }
    }

    #[test]
    fn test_node_response_roundtrip() {
        let outcomes = vec![
            TxOutcome::Success,
            TxOutcome::ConcurrentModification {
                record: RecordId::new(2, 7),
                server_version: 4,
            },
            TxOutcome::RecordLockTimeout {
                node: NodeId::from("node-2"),
                record: RecordId::new(1, 1),
            },
            TxOutcome::KeyLockTimeout {
                node: NodeId::from("node-2"),
                key: "k".into(),
            },
            TxOutcome::UniqueIndexViolation {
                record: RecordId::new(1, 2),
                index: "person.email".into(),
                key: "a@example.com".into(),
            },
            TxOutcome::ConcurrentCreation {
                actual: RecordId::new(1, 3),
                expected: RecordId::new(1, 2),
            },
            TxOutcome::Failure {
                message: "boom".into(),
            },
        ];
        for outcome in outcomes {
            let resp = NodeResponse::Phase1(outcome);
            let bytes = resp.encode().unwrap();
            let mut read = bytes.clone();
            assert_eq!(NodeResponse::decode(&mut read).unwrap(), resp);
        }

        let ack = NodeResponse::Phase2Ack { success: true };
        let mut read = ack.encode().unwrap();
        assert_eq!(NodeResponse::decode(&mut read).unwrap(), ack);
    }

    #[test]
    fn test_submit_transaction_keeps_quorum_policy() {
        use crate::tx::task::{IndexTouch, OperationKind, RecordOp};

        let task = TransactionTask::build(
            &[RecordOp {
                id: RecordId::new(1, 1),
                version: 1,
                kind: OperationKind::Update,
                payload: vec![1],
                record_type: b'd',
            }],
            &[IndexTouch {
                name: "person.email".into(),
                unique: true,
                keys: vec!["a@example.com".into()],
            }],
        );
        let request = SubmitRequest::Transaction(task);

        let bytes = request.encode().unwrap();
        let mut read = bytes.clone();
        let decoded = SubmitRequest::decode(&mut read).unwrap();

        // a remote submitter's unique-index transaction must still demand
        // unanimity after crossing the wire
        match decoded {
            SubmitRequest::Transaction(task) => {
                assert_eq!(task.quorum_type(), QuorumType::All)
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_bad_opcode() {
        let mut read = Bytes::from(vec![0xEEu8]);
        assert!(Operation::decode(&mut read).is_err());
    }
}
