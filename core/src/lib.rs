//! MERIDIAN Core Library
//!
//! Core types, log vocabulary, traits and configuration for the MERIDIAN
//! consensus engine. Every other MERIDIAN crate builds on this one.

pub mod types;
pub mod log;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use log::*;
pub use traits::*;
pub use error::*;
pub use config::*;
