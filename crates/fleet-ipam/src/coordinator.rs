//! Claim-or-retry coordination
//!
//! The allocators compute candidates from a snapshot that may already be
//! stale. The coordinator turns a candidate into an owned resource:
//!
//! 1. load configuration and a snapshot of the taken set (no lock held)
//! 2. ask the allocator for a candidate
//! 3. claim it in the registry (insert-if-absent keyed by the value)
//! 4. on success return it
//! 5. on a lost race (`Conflict`) exclude the candidate and go back to 2
//! 6. on exhaustion stop
//!
//! Each excluded candidate is gone for good, so the loop ends after at most
//! `capacity` claims. Every claim is a single registry call; dropping the
//! future between steps never leaves a half-written claim behind.

use crate::{AddressAllocator, CandidateSpace, PrefixAllocator};
use fleet_common::{
    AllocError, AllocResult, AssignedAddress, ConfigStore, Host, HostSpec, OwnerId, PopName,
    RegistryError, ResourceRegistry,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Makes allocation safe under concurrent callers
#[derive(Clone)]
pub struct AllocationCoordinator {
    registry: Arc<dyn ResourceRegistry>,
    config: Arc<dyn ConfigStore>,
}

impl AllocationCoordinator {
    /// Create a coordinator over a registry and a config source
    pub fn new(registry: Arc<dyn ResourceRegistry>, config: Arc<dyn ConfigStore>) -> Self {
        Self { registry, config }
    }

    /// Claim the next free IPv4/IPv6 pair for a workload
    pub async fn allocate_address_pair(&self, owner: OwnerId) -> AllocResult<AssignedAddress> {
        let config = self.config.get().await?;
        let allocator = AddressAllocator::new(config.address_pool()?);
        let taken = self.registry.list_taken_addresses().await?;

        let registry = &self.registry;
        let owner = &owner;
        self.claim_loop(&allocator, taken, |pair| {
            let address = AssignedAddress::new(pair, owner.clone());
            async move {
                registry
                    .claim_address(address.clone())
                    .await
                    .map(|()| address)
                    .map_err(lost_race)
            }
        })
        .await
    }

    /// Claim the next free /48 and attach a new host to `pop`
    ///
    /// The taken set spans every host in every PoP. `NotFound` if the PoP
    /// does not exist, or disappears before the claim lands.
    pub async fn allocate_prefix_for_host(&self, pop: &PopName, spec: HostSpec) -> AllocResult<Host> {
        self.registry.get_pop(pop).await?;

        let config = self.config.get().await?;
        let allocator = PrefixAllocator::new(config.parent_block()?);
        let taken = self.registry.list_taken_prefixes().await?;

        let registry = &self.registry;
        let spec = &spec;
        self.claim_loop(&allocator, taken, |prefix| {
            let host = Host::new(pop.clone(), spec.clone(), prefix);
            async move {
                registry
                    .claim_prefix(host.clone())
                    .await
                    .map(|()| host)
                    .map_err(lost_race)
            }
        })
        .await
    }

    async fn claim_loop<S, T, F, Fut>(
        &self,
        space: &S,
        mut taken: HashSet<S::Key>,
        mut claim: F,
    ) -> AllocResult<T>
    where
        S: CandidateSpace,
        F: FnMut(S::Candidate) -> Fut,
        Fut: Future<Output = AllocResult<T>>,
    {
        let max_attempts = space.capacity();
        let mut attempts: u64 = 0;

        loop {
            let candidate = match space.next_free(&taken) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!("Allocation failed after {} claim attempts: {}", attempts, e);
                    return Err(e);
                }
            };
            let key = S::key(&candidate);
            attempts += 1;

            match claim(candidate).await {
                Ok(claimed) => {
                    info!("Claimed {} (attempt {})", candidate, attempts);
                    return Ok(claimed);
                }
                Err(AllocError::Conflict(_)) => {
                    debug!("Lost claim for {}, excluding and retrying", key);
                    taken.insert(key);
                    if attempts >= max_attempts {
                        warn!("Gave up after {} contended claims", attempts);
                        return Err(AllocError::ResourceExhausted(format!(
                            "every candidate was claimed concurrently ({} attempts)",
                            attempts
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A claim rejected because the value is held is a lost race
fn lost_race(err: RegistryError) -> AllocError {
    match err {
        RegistryError::AlreadyExists(what) => AllocError::Conflict(what),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_common::{
        AddressPoolConfig, FleetConfig, HostId, InMemoryRegistry, ParentPrefixConfig, Pop,
        RegistryResult, StaticConfigStore,
    };
    use ipnetwork::Ipv6Network;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const CLAIM_DELAY: Duration = Duration::from_millis(50);

    /// Registry wrapper that can serve stale snapshots and fail on demand
    #[derive(Default)]
    struct TestRegistry {
        inner: InMemoryRegistry,
        stale_snapshots: bool,
        phantom_pops: bool,
        broken_claims: bool,
        // sleep CLAIM_DELAY before and after each claim lands
        slow_claims: bool,
    }

    impl TestRegistry {
        async fn pause(&self) {
            if self.slow_claims {
                tokio::time::sleep(CLAIM_DELAY).await;
            }
        }
    }

    #[async_trait]
    impl ResourceRegistry for TestRegistry {
        async fn list_taken_addresses(&self) -> RegistryResult<HashSet<Ipv4Addr>> {
            if self.stale_snapshots {
                return Ok(HashSet::new());
            }
            self.inner.list_taken_addresses().await
        }

        async fn claim_address(&self, address: AssignedAddress) -> RegistryResult<()> {
            if self.broken_claims {
                return Err(RegistryError::StorageError("write failed".into()));
            }
            self.pause().await;
            let claimed = self.inner.claim_address(address).await;
            self.pause().await;
            claimed
        }

        async fn release_address(&self, ipv4: Ipv4Addr) -> RegistryResult<AssignedAddress> {
            self.inner.release_address(ipv4).await
        }

        async fn list_taken_prefixes(&self) -> RegistryResult<HashSet<Ipv6Network>> {
            if self.stale_snapshots {
                return Ok(HashSet::new());
            }
            self.inner.list_taken_prefixes().await
        }

        async fn claim_prefix(&self, host: Host) -> RegistryResult<()> {
            if self.broken_claims {
                return Err(RegistryError::StorageError("write failed".into()));
            }
            self.pause().await;
            let claimed = self.inner.claim_prefix(host).await;
            self.pause().await;
            claimed
        }

        async fn remove_host(&self, pop: &PopName, host: HostId) -> RegistryResult<Host> {
            self.inner.remove_host(pop, host).await
        }

        async fn create_pop(&self, name: PopName) -> RegistryResult<Pop> {
            self.inner.create_pop(name).await
        }

        async fn get_pop(&self, name: &PopName) -> RegistryResult<Pop> {
            if self.phantom_pops {
                return Ok(Pop::new(name.clone()));
            }
            self.inner.get_pop(name).await
        }

        async fn remove_pop(&self, name: &PopName) -> RegistryResult<Pop> {
            self.inner.remove_pop(name).await
        }

        async fn list_pops(&self) -> RegistryResult<Vec<Pop>> {
            self.inner.list_pops().await
        }
    }

    fn config(parent: &str) -> Arc<StaticConfigStore> {
        Arc::new(StaticConfigStore::new(FleetConfig {
            address_pool: Some(AddressPoolConfig::new("10.0.0.", "fd00::")),
            parent_prefix: Some(ParentPrefixConfig::new(parent)),
        }))
    }

    fn coordinator(registry: Arc<dyn ResourceRegistry>) -> AllocationCoordinator {
        AllocationCoordinator::new(registry, config("2001:db8::/32"))
    }

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).unwrap()
    }

    fn pop(name: &str) -> PopName {
        PopName::new(name).unwrap()
    }

    fn spec() -> HostSpec {
        HostSpec {
            ip: "192.0.2.10".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_address_pairs_in_order() {
        let registry = Arc::new(InMemoryRegistry::new());
        let coord = coordinator(registry.clone());

        let first = coord.allocate_address_pair(owner("vm-1")).await.unwrap();
        assert_eq!(first.ipv4.to_string(), "10.0.0.2");
        assert_eq!(first.ipv6.to_string(), "fd00::2");
        assert_eq!(first.owner.as_str(), "vm-1");

        let second = coord.allocate_address_pair(owner("vm-2")).await.unwrap();
        assert_eq!(second.ipv4.to_string(), "10.0.0.3");
        assert_eq!(second.ipv6.to_string(), "fd00::3");

        assert_eq!(registry.address_count(), 2);
    }

    #[tokio::test]
    async fn test_address_pool_exhaustion() {
        let registry = Arc::new(InMemoryRegistry::new());
        let coord = coordinator(registry.clone());

        for i in 0..252 {
            coord.allocate_address_pair(owner(&format!("vm-{}", i))).await.unwrap();
        }

        let err = coord.allocate_address_pair(owner("vm-late")).await.unwrap_err();
        assert!(matches!(err, AllocError::ResourceExhausted(_)));
        assert_eq!(registry.address_count(), 252);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_config() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.create_pop(pop("ams")).await.unwrap();

        let store = Arc::new(StaticConfigStore::empty());
        let coord = AllocationCoordinator::new(registry.clone(), store.clone());

        let err = coord.allocate_address_pair(owner("vm-1")).await.unwrap_err();
        assert!(matches!(err, AllocError::ConfigurationMissing(_)));

        store.set(FleetConfig {
            address_pool: Some(AddressPoolConfig::new("10.0.0.7", "fd00::")),
            parent_prefix: None,
        });
        let err = coord.allocate_address_pair(owner("vm-1")).await.unwrap_err();
        assert!(matches!(err, AllocError::ConfigurationInvalid(_)));

        let err = coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap_err();
        assert!(matches!(err, AllocError::ConfigurationMissing(_)));

        assert_eq!(registry.address_count(), 0);
        assert_eq!(registry.prefix_count(), 0);
    }

    #[tokio::test]
    async fn test_prefixes_highest_first() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.create_pop(pop("ams")).await.unwrap();
        registry.create_pop(pop("fra")).await.unwrap();
        let coord = coordinator(registry.clone());

        let first = coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap();
        assert_eq!(first.prefix().to_string(), "2001:db8:ffff::/48");

        // Fleet-wide: another PoP continues below the first
        let second = coord.allocate_prefix_for_host(&pop("fra"), spec()).await.unwrap();
        assert_eq!(second.prefix().to_string(), "2001:db8:fffe::/48");

        let ams = registry.get_pop(&pop("ams")).await.unwrap();
        assert_eq!(ams.hosts(), &[first]);
    }

    #[tokio::test]
    async fn test_prefix_exhaustion_leaves_no_write() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.create_pop(pop("ams")).await.unwrap();
        let coord = AllocationCoordinator::new(registry.clone(), config("2001:db8::/46"));

        for _ in 0..4 {
            coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap();
        }

        let err = coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap_err();
        assert!(matches!(err, AllocError::ResourceExhausted(_)));
        assert_eq!(registry.prefix_count(), 4);
        assert_eq!(registry.get_pop(&pop("ams")).await.unwrap().hosts().len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_pop() {
        let registry = Arc::new(InMemoryRegistry::new());
        let coord = coordinator(registry.clone());

        let err = coord.allocate_prefix_for_host(&pop("nowhere"), spec()).await.unwrap_err();
        assert!(matches!(err, AllocError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pop_vanishes_before_claim() {
        let registry = Arc::new(TestRegistry {
            phantom_pops: true,
            ..Default::default()
        });
        let coord = coordinator(registry.clone());

        let err = coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap_err();
        assert!(matches!(err, AllocError::NotFound(_)));
        assert_eq!(registry.inner.prefix_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_snapshot_retries_with_exclusion() {
        let registry = Arc::new(TestRegistry {
            stale_snapshots: true,
            ..Default::default()
        });
        let coord = coordinator(registry.clone());

        // Held by someone else, but invisible to the snapshot
        for id in [2, 3, 4] {
            let pair = fleet_common::AddressPair {
                ipv4: Ipv4Addr::new(10, 0, 0, id),
                ipv6: format!("fd00::{}", id).parse().unwrap(),
            };
            registry
                .inner
                .claim_address(AssignedAddress::new(pair, owner("other")))
                .await
                .unwrap();
        }

        let claimed = coord.allocate_address_pair(owner("vm-1")).await.unwrap();
        assert_eq!(claimed.ipv4.to_string(), "10.0.0.5");
        assert_eq!(claimed.ipv6.to_string(), "fd00::5");
    }

    #[tokio::test]
    async fn test_stale_snapshot_bounded_by_capacity() {
        let registry = Arc::new(TestRegistry {
            stale_snapshots: true,
            ..Default::default()
        });
        registry.inner.create_pop(pop("ams")).await.unwrap();
        let coord = AllocationCoordinator::new(registry.clone(), config("2001:db8::/47"));

        coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap();
        coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap();

        let err = coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap_err();
        assert!(matches!(err, AllocError::ResourceExhausted(_)));
        assert_eq!(registry.inner.prefix_count(), 2);
    }

    #[tokio::test]
    async fn test_storage_errors_not_retried() {
        let registry = Arc::new(TestRegistry {
            broken_claims: true,
            ..Default::default()
        });
        registry.inner.create_pop(pop("ams")).await.unwrap();
        let coord = coordinator(registry.clone());

        let err = coord.allocate_address_pair(owner("vm-1")).await.unwrap_err();
        assert!(matches!(err, AllocError::Storage(_)));

        let err = coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap_err();
        assert!(matches!(err, AllocError::Storage(_)));
    }

    #[test]
    fn test_lost_race_becomes_conflict() {
        let err = lost_race(RegistryError::AlreadyExists("10.0.0.2".into()));
        assert_eq!(err, AllocError::Conflict("10.0.0.2".into()));

        let err = lost_race(RegistryError::NotFound("PoP ams".into()));
        assert_eq!(err, AllocError::NotFound("PoP ams".into()));
    }

    async fn hosts_in(registry: &TestRegistry, name: &str) -> usize {
        registry.inner.get_pop(&pop(name)).await.unwrap().hosts().len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_prefix_allocation_is_all_or_nothing() {
        let registry = Arc::new(TestRegistry {
            slow_claims: true,
            ..Default::default()
        });
        registry.inner.create_pop(pop("ams")).await.unwrap();
        let coord = coordinator(registry.clone());

        // Dropped before the claim lands
        let early = CLAIM_DELAY / 2;
        let res = tokio::time::timeout(early, coord.allocate_prefix_for_host(&pop("ams"), spec())).await;
        assert!(res.is_err());
        assert_eq!(registry.inner.prefix_count(), 0);
        assert_eq!(hosts_in(&registry, "ams").await, 0);

        // Dropped after the claim landed
        let late = CLAIM_DELAY + CLAIM_DELAY / 2;
        let res = tokio::time::timeout(late, coord.allocate_prefix_for_host(&pop("ams"), spec())).await;
        assert!(res.is_err());
        assert_eq!(registry.inner.prefix_count(), 1);
        assert_eq!(hosts_in(&registry, "ams").await, 1);

        let held = registry.inner.list_taken_prefixes().await.unwrap();
        let ams = registry.inner.get_pop(&pop("ams")).await.unwrap();
        assert_eq!(held, ams.prefixes().collect::<HashSet<_>>());

        // Next allocation sees the landed claim and moves on
        let next = coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap();
        assert_eq!(next.prefix().to_string(), "2001:db8:fffe::/48");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_address_allocation_is_all_or_nothing() {
        let registry = Arc::new(TestRegistry {
            slow_claims: true,
            ..Default::default()
        });
        let coord = coordinator(registry.clone());

        let early = CLAIM_DELAY / 2;
        let res = tokio::time::timeout(early, coord.allocate_address_pair(owner("vm-1"))).await;
        assert!(res.is_err());
        assert_eq!(registry.inner.address_count(), 0);

        let late = CLAIM_DELAY + CLAIM_DELAY / 2;
        let res = tokio::time::timeout(late, coord.allocate_address_pair(owner("vm-1"))).await;
        assert!(res.is_err());
        assert_eq!(registry.inner.address_count(), 1);

        // Both halves of the landed pair are recorded and released together
        let released = registry.inner.release_address(Ipv4Addr::new(10, 0, 0, 2)).await.unwrap();
        assert_eq!(released.ipv6.to_string(), "fd00::2");
        assert_eq!(registry.inner.address_count(), 0);

        let again = coord.allocate_address_pair(owner("vm-2")).await.unwrap();
        assert_eq!(again.pair(), released.pair());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_address_claims_unique() {
        let registry = Arc::new(TestRegistry {
            stale_snapshots: true,
            ..Default::default()
        });
        let coord = coordinator(registry.clone());

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let coord = coord.clone();
                tokio::spawn(async move { coord.allocate_address_pair(owner(&format!("vm-{}", i))).await })
            })
            .collect();

        let mut seen = HashSet::new();
        for task in tasks {
            let claimed = task.await.unwrap().unwrap();
            assert!(seen.insert(claimed.ipv4), "duplicate {}", claimed.ipv4);
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(registry.inner.address_count(), 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_claims_beyond_capacity() {
        let registry = Arc::new(InMemoryRegistry::new());
        let coord = coordinator(registry.clone());

        let tasks: Vec<_> = (0..300)
            .map(|i| {
                let coord = coord.clone();
                tokio::spawn(async move { coord.allocate_address_pair(owner(&format!("vm-{}", i))).await })
            })
            .collect();

        let mut claimed = HashSet::new();
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(address) => assert!(claimed.insert(address.ipv4)),
                Err(AllocError::ResourceExhausted(_)) => exhausted += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(claimed.len(), 252);
        assert_eq!(exhausted, 48);
        assert_eq!(registry.address_count(), 252);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_prefix_claims_unique() {
        let registry = Arc::new(TestRegistry {
            stale_snapshots: true,
            ..Default::default()
        });
        for name in ["ams", "fra", "lhr", "nyc"] {
            registry.inner.create_pop(pop(name)).await.unwrap();
        }
        let coord = AllocationCoordinator::new(registry.clone(), config("2001:db8::/42"));

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let coord = coord.clone();
                let name = ["ams", "fra", "lhr", "nyc"][i % 4];
                tokio::spawn(async move { coord.allocate_prefix_for_host(&pop(name), spec()).await })
            })
            .collect();

        let mut seen = HashSet::new();
        for task in tasks {
            let host = task.await.unwrap().unwrap();
            assert!(seen.insert(host.prefix()));
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(registry.inner.prefix_count(), 64);

        let err = coord.allocate_prefix_for_host(&pop("ams"), spec()).await.unwrap_err();
        assert!(matches!(err, AllocError::ResourceExhausted(_)));
    }
}
