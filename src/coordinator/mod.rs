//! Coordination layer: ordered replication with quorum acknowledgement
//!
//! One [`DistributedCoordinator`] exists per database. It assigns each
//! submitted request a position in the operation log, fans it out to the
//! current membership, aggregates acknowledgements under a pluggable quorum
//! policy, and answers the submitter. Elections run alongside to establish
//! leadership and to let a rejoining node find the log position to catch up
//! from.

pub mod context;
#[allow(clippy::module_inception)]
pub mod coordinator;
pub mod election;
pub mod log;
pub mod network;
pub mod requests;
pub mod wire;

pub use context::{MajorityHandler, RequestContext, ResponseHandler, UnanimousHandler};
pub use coordinator::{CoordinatorState, DistributedCoordinator};
pub use election::{Election, ElectionContext, ElectionReply, ElectionState};
pub use log::{LogId, OperationLog};
pub use network::{ChannelNetwork, Delivery, NetworkSender};
pub use requests::{
    NodeContext, NodeRequest, NodeResponse, Operation, SubmitRequest, SubmitResponse,
};
