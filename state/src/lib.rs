//! MERIDIAN State Management
//!
//! Log persistence (in-memory and sled-backed implementations of
//! `LogStore`), local snapshot retention and a transactional key-value
//! state machine.

pub mod store;
pub mod memory;
pub mod persistent;
pub mod snapshot;
pub mod kv;

pub use store::*;
pub use memory::*;
pub use persistent::*;
pub use snapshot::*;
pub use kv::*;
