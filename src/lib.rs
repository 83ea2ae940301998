//! # minirep
//!
//! The replication/coordination core of a distributed database:
//! - A causally-chained operation log assigning every replicated request a
//!   total order per database
//! - A per-database coordinator actor that fans requests out to the cluster
//!   and aggregates acknowledgements under pluggable quorum policies
//! - Term-scoped leader election with most-advanced-log winner selection
//! - A two-phase optimistic distributed-transaction protocol that retries on
//!   lock contention instead of failing
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Coordinator (per database)            │
//! │  submit ─▶ operation log ─▶ fan-out          │
//! │  receive ◀─ member acks ─▶ quorum handler    │
//! └──────┬───────────────┬───────────────┬───────┘
//!        │               │               │
//!  ┌─────▼─────┐   ┌─────▼─────┐   ┌─────▼─────┐
//!  │ Member 1  │   │ Member 2  │   │ Member 3  │
//!  │ phase 1/2 │   │ phase 1/2 │   │ phase 1/2 │
//!  │ + locks   │   │ + locks   │   │ + locks   │
//!  └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! Record storage, secondary indexes, and transport framing stay outside
//! this crate, consumed through the [`tx::RecordStore`], [`tx::LockManager`],
//! and [`coordinator::NetworkSender`] seams.

pub mod common;
pub mod coordinator;
pub mod tx;

// Re-export commonly used types
pub use common::{CoordinatorConfig, Error, NodeId, OperationId, Result};
pub use coordinator::{DistributedCoordinator, LogId, OperationLog};
pub use tx::{TransactionTask, TxOutcome};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
