//! Workload address allocation
//!
//! One flat pool of 252 host slots. Slot `n` maps to `ipv4_base + n` and to
//! the IPv6 base with `n` written into its last group, so `10.0.0.42` pairs
//! with `fd00::42`.

use crate::CandidateSpace;
use fleet_common::{AddressPair, AddressPool, AllocError, AllocResult};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Host identifier reserved for the PoP's control-plane address
pub const CONTROL_PLANE_HOST_ID: u8 = 1;

/// First identifier handed to workloads
pub const FIRST_HOST_ID: u8 = 2;

/// Last identifier handed to workloads
pub const LAST_HOST_ID: u8 = 253;

/// Slots per pool
pub const POOL_CAPACITY: u64 = (LAST_HOST_ID - FIRST_HOST_ID + 1) as u64;

/// Computes the next free address pair in a pool
#[derive(Debug, Clone, Copy)]
pub struct AddressAllocator {
    pool: AddressPool,
}

impl AddressAllocator {
    /// Create allocator over a validated pool
    pub fn new(pool: AddressPool) -> Self {
        Self { pool }
    }

    /// Address pair for a host identifier
    pub fn slot(&self, id: u8) -> AddressPair {
        AddressPair {
            ipv4: Ipv4Addr::from(u32::from(self.pool.ipv4_base()) + u32::from(id)),
            ipv6: Ipv6Addr::from(u128::from(self.pool.ipv6_base()) + u128::from(last_group(id))),
        }
    }

    /// Lowest free slot in 2..=253 whose IPv4 is not in `taken`
    pub fn allocate(&self, taken: &HashSet<Ipv4Addr>) -> AllocResult<AddressPair> {
        (FIRST_HOST_ID..=LAST_HOST_ID)
            .map(|id| self.slot(id))
            .find(|pair| !taken.contains(&pair.ipv4))
            .ok_or_else(|| {
                AllocError::ResourceExhausted(format!(
                    "all {} addresses above {} are taken",
                    POOL_CAPACITY,
                    self.pool.ipv4_base()
                ))
            })
    }
}

/// Last IPv6 group that reads the same as the decimal identifier
fn last_group(id: u8) -> u16 {
    let id = u16::from(id);
    ((id / 100) << 8) | ((id / 10 % 10) << 4) | (id % 10)
}

impl CandidateSpace for AddressAllocator {
    type Key = Ipv4Addr;
    type Candidate = AddressPair;

    fn capacity(&self) -> u64 {
        POOL_CAPACITY
    }

    fn next_free(&self, taken: &HashSet<Ipv4Addr>) -> AllocResult<AddressPair> {
        self.allocate(taken)
    }

    fn key(candidate: &AddressPair) -> Ipv4Addr {
        candidate.ipv4
    }
}
