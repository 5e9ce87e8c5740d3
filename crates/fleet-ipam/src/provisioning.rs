//! Provisioning workflows built on the coordinator
//!
//! PoP lifecycle, host onboarding/removal and workload address
//! provisioning/release. Removal paths hand resources back to the registry
//! so later allocations can reuse them.

use crate::AllocationCoordinator;
use fleet_common::{
    AllocResult, AssignedAddress, ConfigStore, Host, HostId, HostSpec, OwnerId, Pop, PopName,
    ResourceRegistry,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

/// Entry point used by provisioning-request handlers
#[derive(Clone)]
pub struct FleetProvisioner {
    registry: Arc<dyn ResourceRegistry>,
    coordinator: AllocationCoordinator,
}

impl FleetProvisioner {
    /// Create a provisioner over a registry and a config source
    pub fn new(registry: Arc<dyn ResourceRegistry>, config: Arc<dyn ConfigStore>) -> Self {
        Self {
            coordinator: AllocationCoordinator::new(registry.clone(), config),
            registry,
        }
    }

    /// Register a new, empty PoP
    pub async fn add_pop(&self, name: &str) -> AllocResult<Pop> {
        let pop = self.registry.create_pop(PopName::new(name)?).await?;
        info!("PoP {} added", pop.name());
        Ok(pop)
    }

    /// Delete a PoP; every prefix its hosts held becomes free
    pub async fn remove_pop(&self, name: &PopName) -> AllocResult<Pop> {
        let pop = self.registry.remove_pop(name).await?;
        info!("PoP {} removed, {} prefixes released", name, pop.hosts().len());
        Ok(pop)
    }

    /// Look up a PoP
    pub async fn pop(&self, name: &PopName) -> AllocResult<Pop> {
        Ok(self.registry.get_pop(name).await?)
    }

    /// All PoPs, ordered by name
    pub async fn pops(&self) -> AllocResult<Vec<Pop>> {
        Ok(self.registry.list_pops().await?)
    }

    /// Add a host to a PoP with a freshly allocated /48
    pub async fn add_host(&self, pop: &PopName, spec: HostSpec) -> AllocResult<Host> {
        let host = self.coordinator.allocate_prefix_for_host(pop, spec).await?;
        info!("Host {} ({}) added to {} with {}", host.id(), host.ip(), pop, host.prefix());
        Ok(host)
    }

    /// Remove a host and release its /48
    pub async fn remove_host(&self, pop: &PopName, host: HostId) -> AllocResult<Host> {
        let removed = self.registry.remove_host(pop, host).await?;
        info!("Host {} removed from {}, released {}", host, pop, removed.prefix());
        Ok(removed)
    }

    /// Allocate an address pair for a new workload
    pub async fn provision_workload(&self, owner: &str) -> AllocResult<AssignedAddress> {
        let address = self.coordinator.allocate_address_pair(OwnerId::new(owner)?).await?;
        info!("Workload {} assigned {}", address.owner, address.pair());
        Ok(address)
    }

    /// Release a workload's address pair
    pub async fn release_workload(&self, ipv4: Ipv4Addr) -> AllocResult<AssignedAddress> {
        let released = self.registry.release_address(ipv4).await?;
        info!("Workload {} released {}", released.owner, released.pair());
        Ok(released)
    }
}
