//! MERIDIAN Node
//!
//! Hosts consensus groups behind one protocol manager and exposes them:
//! - peer-to-peer delivery over HTTP
//! - per-group logs in memory or sled
//! - cross-shard transactions
//! - HTTP API

mod api;
mod runtime;
mod transport;

pub use api::*;
pub use runtime::*;
pub use transport::*;
