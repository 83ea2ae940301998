//! Transaction outcome taxonomy
//!
//! A replicated transaction attempt resolves to exactly one of these
//! variants on every replica. The taxonomy is closed: replicas executing the
//! same task independently must classify identical conditions identically,
//! otherwise quorum aggregation at the coordinator is meaningless.
//!
//! Lock contention is deliberately absent from the terminal set produced by
//! a first execution: it is flow control handled by re-enqueueing the task
//! (see [`crate::tx::executor`]). The `RecordLockTimeout`/`KeyLockTimeout`
//! variants exist so a caller that exhausts its own retry budget can still
//! surface the condition as a typed result.

use crate::common::NodeId;
use crate::tx::task::RecordId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// All record operations applied under optimistic versioning.
    Success,
    /// Stale expected version on an update; the client must reconcile.
    ConcurrentModification {
        record: RecordId,
        server_version: i32,
    },
    /// A record lock could not be acquired before its deadline.
    RecordLockTimeout { node: NodeId, record: RecordId },
    /// An index key lock could not be acquired before its deadline.
    KeyLockTimeout { node: NodeId, key: String },
    /// A unique index rejected a duplicate key during local apply.
    UniqueIndexViolation {
        record: RecordId,
        index: String,
        key: String,
    },
    /// Two replicas independently created conflicting identities.
    ConcurrentCreation {
        actual: RecordId,
        expected: RecordId,
    },
    /// Uncaught failure during local apply; surfaced, never retried.
    Failure { message: String },
}

impl TxOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TxOutcome::Success)
    }
}

impl std::fmt::Display for TxOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxOutcome::Success => write!(f, "success"),
            TxOutcome::ConcurrentModification {
                record,
                server_version,
            } => write!(
                f,
                "concurrent modification of {} (server version {})",
                record, server_version
            ),
            TxOutcome::RecordLockTimeout { node, record } => {
                write!(f, "record lock timeout on {} for {}", node, record)
            }
            TxOutcome::KeyLockTimeout { node, key } => {
                write!(f, "key lock timeout on {} for {:?}", node, key)
            }
            TxOutcome::UniqueIndexViolation { record, index, key } => {
                write!(
                    f,
                    "unique index {} violated by {} (key {:?})",
                    index, record, key
                )
            }
            TxOutcome::ConcurrentCreation { actual, expected } => {
                write!(
                    f,
                    "concurrent creation: got {}, expected {}",
                    actual, expected
                )
            }
            TxOutcome::Failure { message } => write!(f, "failure: {}", message),
        }
    }
}
