//! Two-phase optimistic distributed transactions
//!
//! Phase 1 serializes a local transaction's record operations into a
//! [`task::TransactionTask`], replicates it through the coordinator, and has
//! every member apply it locally under optimistic concurrency control.
//! Phase 2 commits or rolls back once the coordinator has evaluated quorum.
//! Lock contention never fails a transaction; it re-enqueues it.

pub mod executor;
pub mod outcome;
pub mod task;

pub use executor::{
    execute_phase1, execute_phase2, ApplyError, LockManager, LockStatus, Phase1, RecordStore,
    RetryQueue,
};
pub use outcome::TxOutcome;
pub use task::{IndexTouch, OperationKind, QuorumType, RecordId, RecordOp, TransactionTask};
