//! MERIDIAN Consensus Engine
//!
//! Implements replicated logs for groups of nodes with:
//! - Crash-fault-tolerant leader election and log replication
//! - Byzantine-fault-tolerant three-phase ordering with view changes
//! - Behavioral fault detection, checkpoints and state recovery
//! - Batching, pipelining and cross-shard two-phase commit

pub mod apply;
pub mod batching;
pub mod bft;
pub mod cft;
pub mod driver;
pub mod engine;
pub mod fault_detector;
pub mod membership;
pub mod message;
pub mod proposal;
pub mod protocol;
pub mod recovery;
pub mod sharding;
pub mod transport;
pub mod view_change;
pub mod vote;

pub use apply::{AppliedRequest, Applier, ApplyOutcome};
pub use batching::*;
pub use bft::BftProtocol;
pub use cft::CftProtocol;
pub use driver::*;
pub use engine::*;
pub use fault_detector::*;
pub use membership::*;
pub use message::*;
pub use proposal::*;
pub use protocol::*;
pub use recovery::*;
pub use sharding::*;
pub use transport::*;
pub use vote::*;
