//! Host /48 allocation
//!
//! Subnets of the parent block are handed out highest first so the low end
//! of the block stays free for manual assignment.

use crate::CandidateSpace;
use fleet_common::{AllocError, AllocResult};
use ipnetwork::Ipv6Network;
use std::collections::HashSet;
use std::net::Ipv6Addr;

/// Prefix length assigned to every host
pub const HOST_PREFIX_LEN: u8 = 48;

/// Computes the next free /48 in a parent block
#[derive(Debug, Clone, Copy)]
pub struct PrefixAllocator {
    parent: Ipv6Network,
}

impl PrefixAllocator {
    /// Create allocator over a parent block
    pub fn new(parent: Ipv6Network) -> Self {
        Self { parent }
    }

    /// Parent block
    pub fn parent(&self) -> Ipv6Network {
        self.parent
    }

    /// Number of /48s in the parent, zero if the parent is longer than /48
    pub fn subnet_count(&self) -> u64 {
        match HOST_PREFIX_LEN.checked_sub(self.parent.prefix()) {
            Some(bits) => 1u64 << bits,
            None => 0,
        }
    }

    /// Every /48 of the parent, numerically descending
    pub fn subnets(&self) -> impl Iterator<Item = Ipv6Network> {
        let base = u128::from(self.parent.network());
        let shift = 128 - u32::from(HOST_PREFIX_LEN);
        (0..self.subnet_count())
            .rev()
            .map(move |index| Ipv6Addr::from(base | (u128::from(index) << shift)))
            // HOST_PREFIX_LEN is a valid IPv6 prefix length, so this never drops
            .filter_map(|addr| Ipv6Network::new(addr, HOST_PREFIX_LEN).ok())
    }

    /// Highest /48 not in `taken`
    ///
    /// Exhaustion is only reported after the whole sequence was walked.
    pub fn allocate(&self, taken: &HashSet<Ipv6Network>) -> AllocResult<Ipv6Network> {
        if self.parent.prefix() > HOST_PREFIX_LEN {
            return Err(AllocError::ResourceExhausted(format!(
                "{} cannot be divided into /{}s",
                self.parent, HOST_PREFIX_LEN
            )));
        }

        self.subnets()
            .find(|subnet| !taken.contains(subnet))
            .ok_or_else(|| {
                AllocError::ResourceExhausted(format!(
                    "all {} /{}s in {} are taken",
                    self.subnet_count(),
                    HOST_PREFIX_LEN,
                    self.parent
                ))
            })
    }
}

impl CandidateSpace for PrefixAllocator {
    type Key = Ipv6Network;
    type Candidate = Ipv6Network;

    fn capacity(&self) -> u64 {
        self.subnet_count()
    }

    fn next_free(&self, taken: &HashSet<Ipv6Network>) -> AllocResult<Ipv6Network> {
        self.allocate(taken)
    }

    fn key(candidate: &Ipv6Network) -> Ipv6Network {
        *candidate
    }
}
