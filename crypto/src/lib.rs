//! MERIDIAN Cryptography Module
//!
//! Provides cryptographic primitives using standard, audited algorithms:
//! - Ed25519 for signatures on votes, view changes and checkpoints
//! - BLAKE3 for hashing and Merkle roots (SHA-256 fallback)
//! - Quorum endorsement verification

pub mod keys;
pub mod signing;
pub mod hashing;
pub mod quorum;

pub use keys::*;
pub use signing::*;
pub use hashing::*;
pub use quorum::*;
