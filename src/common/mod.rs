//! Common utilities and types shared across minirep

pub mod config;
pub mod error;
pub mod identity;

pub use config::CoordinatorConfig;
pub use error::{Error, Result};
pub use identity::{NodeId, OperationId};
