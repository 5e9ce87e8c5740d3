//! Repositories - Persistence abstraction for assigned resources
//!
//! The registry is the single point of mutual exclusion for allocation:
//! every `claim_*` call is an atomic insert-if-absent keyed by the resource
//! value itself, so two callers racing for the same candidate cannot both
//! succeed.

use super::aggregates::*;
use super::value_objects::*;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnetwork::Ipv6Network;
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// Registry result type
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

/// Durable store of PoPs, hosts and claimed network resources
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    /// Snapshot of every claimed IPv4 address
    async fn list_taken_addresses(&self) -> RegistryResult<HashSet<Ipv4Addr>>;

    /// Claim an address pair; `AlreadyExists` if either address is held
    async fn claim_address(&self, address: AssignedAddress) -> RegistryResult<()>;

    /// Release an address pair so it can be handed out again
    async fn release_address(&self, ipv4: Ipv4Addr) -> RegistryResult<AssignedAddress>;

    /// Snapshot of every /48 held by any host in any PoP
    async fn list_taken_prefixes(&self) -> RegistryResult<HashSet<Ipv6Network>>;

    /// Claim the host's prefix fleet-wide and append the host to its PoP.
    ///
    /// `NotFound` if the PoP does not exist, `AlreadyExists` if the prefix
    /// is held. Either way nothing is written.
    async fn claim_prefix(&self, host: Host) -> RegistryResult<()>;

    /// Remove a host from its PoP and release its prefix
    async fn remove_host(&self, pop: &PopName, host: HostId) -> RegistryResult<Host>;

    /// Create an empty PoP
    async fn create_pop(&self, name: PopName) -> RegistryResult<Pop>;

    /// Get PoP by name
    async fn get_pop(&self, name: &PopName) -> RegistryResult<Pop>;

    /// Delete a PoP and release every prefix its hosts held
    async fn remove_pop(&self, name: &PopName) -> RegistryResult<Pop>;

    /// List all PoPs
    async fn list_pops(&self) -> RegistryResult<Vec<Pop>>;
}

/// In-memory registry (for testing and single-process deployments)
///
/// Lock order is `addresses` before `ipv6_index` and `pops` before
/// `prefixes`; no path holds a guard on one map while touching the same map.
#[derive(Default)]
pub struct InMemoryRegistry {
    addresses: DashMap<Ipv4Addr, AssignedAddress>,
    ipv6_index: DashMap<Ipv6Addr, Ipv4Addr>,
    pops: DashMap<PopName, Pop>,
    prefixes: DashMap<Ipv6Network, AssignedPrefix>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of claimed address pairs
    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }

    /// Number of claimed prefixes
    pub fn prefix_count(&self) -> usize {
        self.prefixes.len()
    }
}

#[async_trait]
impl ResourceRegistry for InMemoryRegistry {
    async fn list_taken_addresses(&self) -> RegistryResult<HashSet<Ipv4Addr>> {
        Ok(self.addresses.iter().map(|entry| *entry.key()).collect())
    }

    async fn claim_address(&self, address: AssignedAddress) -> RegistryResult<()> {
        match self.addresses.entry(address.ipv4) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists(address.ipv4.to_string())),
            Entry::Vacant(slot) => match self.ipv6_index.entry(address.ipv6) {
                Entry::Occupied(_) => {
                    Err(RegistryError::AlreadyExists(address.ipv6.to_string()))
                }
                Entry::Vacant(v6) => {
                    debug!("Address {} claimed by {}", address.pair(), address.owner);
                    v6.insert(address.ipv4);
                    slot.insert(address);
                    Ok(())
                }
            },
        }
    }

    async fn release_address(&self, ipv4: Ipv4Addr) -> RegistryResult<AssignedAddress> {
        let (_, released) = self
            .addresses
            .remove(&ipv4)
            .ok_or_else(|| RegistryError::NotFound(format!("address {}", ipv4)))?;
        self.ipv6_index.remove(&released.ipv6);
        debug!("Address {} released by {}", released.pair(), released.owner);
        Ok(released)
    }

    async fn list_taken_prefixes(&self) -> RegistryResult<HashSet<Ipv6Network>> {
        Ok(self.prefixes.iter().map(|entry| *entry.key()).collect())
    }

    async fn claim_prefix(&self, host: Host) -> RegistryResult<()> {
        let mut pop = self
            .pops
            .get_mut(host.pop())
            .ok_or_else(|| RegistryError::NotFound(format!("PoP {}", host.pop())))?;

        match self.prefixes.entry(host.prefix()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists(host.prefix().to_string())),
            Entry::Vacant(slot) => {
                let assigned = host.assigned_prefix();
                pop.add_host(host)
                    .map_err(|e| RegistryError::StorageError(e.to_string()))?;
                debug!("Prefix {} claimed by host {} in {}", assigned.prefix, assigned.owner, assigned.pop);
                slot.insert(assigned);
                Ok(())
            }
        }
    }

    async fn remove_host(&self, pop: &PopName, host: HostId) -> RegistryResult<Host> {
        let mut entry = self
            .pops
            .get_mut(pop)
            .ok_or_else(|| RegistryError::NotFound(format!("PoP {}", pop)))?;
        let removed = entry
            .remove_host(host)
            .ok_or_else(|| RegistryError::NotFound(format!("host {} in PoP {}", host, pop)))?;
        self.prefixes.remove(&removed.prefix());
        debug!("Prefix {} released by host {} in {}", removed.prefix(), host, pop);
        Ok(removed)
    }

    async fn create_pop(&self, name: PopName) -> RegistryResult<Pop> {
        match self.pops.entry(name) {
            Entry::Occupied(entry) => {
                Err(RegistryError::AlreadyExists(format!("PoP {}", entry.key())))
            }
            Entry::Vacant(slot) => {
                let pop = Pop::new(slot.key().clone());
                slot.insert(pop.clone());
                Ok(pop)
            }
        }
    }

    async fn get_pop(&self, name: &PopName) -> RegistryResult<Pop> {
        self.pops
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(format!("PoP {}", name)))
    }

    async fn remove_pop(&self, name: &PopName) -> RegistryResult<Pop> {
        let (_, pop) = self
            .pops
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(format!("PoP {}", name)))?;
        for prefix in pop.prefixes() {
            self.prefixes.remove(&prefix);
            debug!("Prefix {} released with PoP {}", prefix, name);
        }
        Ok(pop)
    }

    async fn list_pops(&self) -> RegistryResult<Vec<Pop>> {
        let mut pops: Vec<_> = self.pops.iter().map(|entry| entry.value().clone()).collect();
        pops.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(pops)
    }
}
