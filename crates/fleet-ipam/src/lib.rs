//! Fleet IPAM - network resource allocation for the hosting fleet
//!
//! Hands out IPv4/IPv6 address pairs to workloads and /48 prefixes to
//! hosts without ever giving the same resource to two owners.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        FleetProvisioner                           │
//! │        PoP lifecycle │ add/remove host │ provision/release        │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                  AllocationCoordinator                      │  │
//! │  │   config snapshot ─► candidate ─► claim ─► retry/exclude    │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │                                                                  │
//! │  ┌──────────────────────┐        ┌─────────────────────────────┐ │
//! │  │  AddressAllocator    │        │  PrefixAllocator            │ │
//! │  │  ids 2..=253, asc    │        │  /48s of parent, desc       │ │
//! │  └──────────────────────┘        └─────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//!                 │ list / claim (insert-if-absent)
//!        ┌────────▼─────────┐   ┌──────────────┐
//!        │ ResourceRegistry │   │ ConfigStore  │
//!        └──────────────────┘   └──────────────┘
//! ```
//!
//! The allocators are pure functions of a configuration snapshot and a
//! "taken" set. Uniqueness under concurrency comes only from the registry's
//! atomic claim; there is no in-process lock around allocation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod coordinator;
pub mod prefix;
pub mod provisioning;

use fleet_common::AllocResult;
use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;

pub use address::AddressAllocator;
pub use coordinator::AllocationCoordinator;
pub use prefix::PrefixAllocator;
pub use provisioning::FleetProvisioner;

/// A finite, totally ordered sequence of candidates an allocator scans.
///
/// `next_free` must be deterministic: the same `taken` set always yields
/// the same candidate, so excluding a lost candidate always makes progress.
pub trait CandidateSpace {
    /// Value the registry enforces uniqueness on
    type Key: Copy + Eq + Hash + Display;
    /// Value handed to the claim
    type Candidate: Copy + Display;

    /// Number of candidates in the space
    fn capacity(&self) -> u64;

    /// First candidate whose key is not in `taken`
    fn next_free(&self, taken: &HashSet<Self::Key>) -> AllocResult<Self::Candidate>;

    /// Uniqueness key of a candidate
    fn key(candidate: &Self::Candidate) -> Self::Key;
}
