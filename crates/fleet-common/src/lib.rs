//! Fleet Common - Shared types for the fleet control plane
//!
//! This crate provides:
//! - PoP, host and resource-assignment records
//! - The resource registry abstraction and an in-memory implementation
//! - Address pool and parent-prefix configuration
//! - Error handling

#![warn(clippy::all)]

pub mod config;
pub mod domain;
pub mod error;

pub use config::*;
pub use domain::*;
pub use error::*;
