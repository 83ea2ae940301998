//! Replicated transaction task
//!
//! A [`TransactionTask`] captures the ordered record operations of one local
//! transaction in a wire-transmissible form. The coordinator replicates it
//! through the operation log; every member then re-executes its copy against
//! its own storage state (see [`crate::tx::executor`]).

use crate::common::Result;
use crate::coordinator::log::LogId;
use crate::coordinator::wire;
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;

/// Identity of a record: owning cluster plus position within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub cluster: i32,
    pub position: i64,
}

impl RecordId {
    pub fn new(cluster: i32, position: i64) -> Self {
        Self { cluster, position }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

/// Kind of a record operation. Byte values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationKind {
    /// No-op placeholder; skipped during serialization and application.
    Loaded = 0,
    Update = 1,
    Delete = 2,
    Create = 3,
}

impl OperationKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OperationKind::Loaded),
            1 => Ok(OperationKind::Update),
            2 => Ok(OperationKind::Delete),
            3 => Ok(OperationKind::Create),
            other => Err(crate::Error::Wire(format!(
                "unknown operation kind: {}",
                other
            ))),
        }
    }

    /// Does this kind carry a record payload on the wire?
    fn has_payload(self) -> bool {
        matches!(self, OperationKind::Create | OperationKind::Update)
    }
}

/// One record operation within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOp {
    pub id: RecordId,
    /// Expected version for optimistic concurrency control.
    pub version: i32,
    pub kind: OperationKind,
    /// Serialized record content; empty for deletes and placeholders.
    pub payload: Vec<u8>,
    /// Record type tag, opaque to the coordination layer.
    pub record_type: u8,
}

/// An index touched by a transaction, as reported by the index layer.
#[derive(Debug, Clone)]
pub struct IndexTouch {
    pub name: String,
    pub unique: bool,
    /// Keys written under this index; unique keys are lock targets.
    pub keys: Vec<String>,
}

/// Quorum policy for a replicated write. Byte values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QuorumType {
    /// Majority acknowledgement.
    Write = 0,
    /// Every member must acknowledge. Required when a unique index is
    /// touched: uniqueness must hold cluster-wide, not by majority vote.
    All = 1,
}

impl QuorumType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QuorumType::Write),
            1 => Ok(QuorumType::All),
            other => Err(crate::Error::Wire(format!(
                "unknown quorum type: {}",
                other
            ))),
        }
    }
}

/// Serialized form of one local transaction, replicated to all members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionTask {
    operations: Vec<RecordOp>,
    quorum_type: QuorumType,
    retry_count: u32,
    last_position: Option<LogId>,
}

impl TransactionTask {
    /// Build from a transaction's record operations and the indexes it
    /// touches. `Loaded` placeholders are dropped; any unique index
    /// escalates the quorum policy to [`QuorumType::All`].
    pub fn build(ops: &[RecordOp], indexes: &[IndexTouch]) -> Self {
        let operations = ops
            .iter()
            .filter(|op| op.kind != OperationKind::Loaded)
            .cloned()
            .collect();

        let quorum_type = if indexes.iter().any(|idx| idx.unique) {
            QuorumType::All
        } else {
            QuorumType::Write
        };

        Self {
            operations,
            quorum_type,
            retry_count: 0,
            last_position: None,
        }
    }

    pub fn operations(&self) -> &[RecordOp] {
        &self.operations
    }

    pub fn quorum_type(&self) -> QuorumType {
        self.quorum_type
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Record one more lock-contention retry.
    pub fn bump_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn last_position(&self) -> Option<LogId> {
        self.last_position
    }

    pub fn set_last_position(&mut self, position: Option<LogId>) {
        self.last_position = position;
    }

    /// Replication timeout, scaled with batch size: larger transactions get
    /// proportionally more time before the coordinator escalates.
    pub fn distributed_timeout(&self, base: Duration) -> Duration {
        base + Duration::from_millis((self.operations.len() / 10) as u64)
    }

    /// Routing hint: sum of the cluster ids of all touched records,
    /// duplicates counted. A coarse locality hint, not a partition key.
    pub fn partition_hint(&self) -> i64 {
        self.operations
            .iter()
            .map(|op| op.id.cluster as i64)
            .sum()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32(self.operations.len() as i32);
        for op in &self.operations {
            buf.put_u8(op.kind as u8);
            buf.put_i32(op.id.cluster);
            buf.put_i64(op.id.position);
            buf.put_i32(op.version);
            buf.put_u8(op.record_type);
            if op.kind.has_payload() {
                wire::put_bytes(buf, &op.payload);
            }
        }
        // The quorum policy travels with the task: the receiving coordinator
        // cannot recompute it, the index keys that forced it are not shipped.
        buf.put_u8(self.quorum_type as u8);
        wire::put_opt_log_id(buf, self.last_position);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let count = wire::get_i32(buf)?;
        if count < 0 {
            return Err(crate::Error::Wire("negative operation count".into()));
        }

        let mut operations = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = OperationKind::from_u8(wire::get_u8(buf)?)?;
            let cluster = wire::get_i32(buf)?;
            let position = wire::get_i64(buf)?;
            let version = wire::get_i32(buf)?;
            let record_type = wire::get_u8(buf)?;
            let payload = if kind.has_payload() {
                wire::get_bytes(buf)?
            } else {
                Vec::new()
            };
            operations.push(RecordOp {
                id: RecordId::new(cluster, position),
                version,
                kind,
                payload,
                record_type,
            });
        }

        let quorum_type = QuorumType::from_u8(wire::get_u8(buf)?)?;
        let last_position = wire::get_opt_log_id(buf)?;

        Ok(Self {
            operations,
            quorum_type,
            retry_count: 0,
            last_position,
        })
    }
}
