//! Fleet Configuration
//!
//! Address pool and parent-prefix settings. Allocators never read ambient
//! state: each allocation attempt fetches one snapshot from a
//! [`ConfigStore`] and passes the validated values down explicitly.

use crate::error::{AllocError, AllocResult};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

/// Environment variable naming the configuration document
pub const CONFIG_PATH_ENV: &str = "FLEET_CONFIG_PATH";

/// Default configuration document location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleet/ipam.json";

/// Fleet configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Workload address pool
    #[serde(default)]
    pub address_pool: Option<AddressPoolConfig>,
    /// Parent block carved into host /48s
    #[serde(default)]
    pub parent_prefix: Option<ParentPrefixConfig>,
}

/// Workload address pool, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPoolConfig {
    /// IPv4 base, e.g. `10.0.0.` or `10.0.0.0/24`
    pub ipv4_base: String,
    /// IPv6 base, e.g. `fd00::`
    pub ipv6_base: String,
}

/// Parent IPv6 block, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentPrefixConfig {
    /// CIDR, e.g. `2001:db8::/32`
    pub parent_block: String,
}

/// Validated address pool
///
/// # Invariants
/// - IPv4 base has a zero last octet
/// - IPv6 base has a zero last group
///
/// so that every host identifier in 2..=253 lands inside the same /24
/// (resp. /112) without carrying into the network part. The IPv6 group
/// holds the identifier's decimal digits, up to `::253`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    ipv4_base: Ipv4Addr,
    ipv6_base: Ipv6Addr,
}

impl AddressPool {
    pub fn ipv4_base(&self) -> Ipv4Addr {
        self.ipv4_base
    }

    pub fn ipv6_base(&self) -> Ipv6Addr {
        self.ipv6_base
    }
}

impl AddressPoolConfig {
    pub fn new(ipv4_base: impl Into<String>, ipv6_base: impl Into<String>) -> Self {
        Self {
            ipv4_base: ipv4_base.into(),
            ipv6_base: ipv6_base.into(),
        }
    }

    /// Validate into an [`AddressPool`]
    pub fn validate(&self) -> AllocResult<AddressPool> {
        Ok(AddressPool {
            ipv4_base: parse_ipv4_base(&self.ipv4_base)?,
            ipv6_base: parse_ipv6_base(&self.ipv6_base)?,
        })
    }
}

impl ParentPrefixConfig {
    pub fn new(parent_block: impl Into<String>) -> Self {
        Self {
            parent_block: parent_block.into(),
        }
    }

    /// Parse the parent block, normalized to its network address
    pub fn validate(&self) -> AllocResult<Ipv6Network> {
        let raw = self.parent_block.trim();
        let block: Ipv6Network = raw.parse().map_err(|e| {
            AllocError::ConfigurationInvalid(format!("parent block {:?}: {}", raw, e))
        })?;
        Ipv6Network::new(block.network(), block.prefix()).map_err(|e| {
            AllocError::ConfigurationInvalid(format!("parent block {:?}: {}", raw, e))
        })
    }
}

impl FleetConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Parse a JSON document
    pub fn from_json(content: &str) -> AllocResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| AllocError::ConfigurationInvalid(format!("fleet config: {}", e)))
    }

    /// Validated address pool; `ConfigurationMissing` if unset
    pub fn address_pool(&self) -> AllocResult<AddressPool> {
        self.address_pool
            .as_ref()
            .ok_or_else(|| AllocError::ConfigurationMissing("address pool".into()))?
            .validate()
    }

    /// Validated parent block; `ConfigurationMissing` if unset
    pub fn parent_block(&self) -> AllocResult<Ipv6Network> {
        self.parent_prefix
            .as_ref()
            .ok_or_else(|| AllocError::ConfigurationMissing("parent prefix".into()))?
            .validate()
    }
}

fn parse_ipv4_base(raw: &str) -> AllocResult<Ipv4Addr> {
    let raw = raw.trim();
    let invalid = |reason: String| {
        AllocError::ConfigurationInvalid(format!("IPv4 base {:?}: {}", raw, reason))
    };

    let base = if raw.contains('/') {
        let net: Ipv4Network = raw.parse().map_err(|e| invalid(format!("{}", e)))?;
        if net.prefix() > 24 {
            return Err(invalid("needs at least a /24".into()));
        }
        net.network()
    } else if let Some(stem) = raw.strip_suffix('.') {
        format!("{}.0", stem)
            .parse::<Ipv4Addr>()
            .map_err(|e| invalid(format!("{}", e)))?
    } else {
        raw.parse::<Ipv4Addr>().map_err(|e| invalid(format!("{}", e)))?
    };

    if base.octets()[3] != 0 {
        return Err(invalid("last octet must be 0".into()));
    }
    Ok(base)
}

fn parse_ipv6_base(raw: &str) -> AllocResult<Ipv6Addr> {
    let raw = raw.trim();
    let invalid = |reason: String| {
        AllocError::ConfigurationInvalid(format!("IPv6 base {:?}: {}", raw, reason))
    };

    let base = if raw.contains('/') {
        let net: Ipv6Network = raw.parse().map_err(|e| invalid(format!("{}", e)))?;
        if net.prefix() > 112 {
            return Err(invalid("needs at least a /112".into()));
        }
        net.network()
    } else {
        raw.parse::<Ipv6Addr>().map_err(|e| invalid(format!("{}", e)))?
    };

    if base.segments()[7] != 0 {
        return Err(invalid("last group must be 0".into()));
    }
    Ok(base)
}

/// Source of the current fleet configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current configuration; `ConfigurationMissing` if none is available
    async fn get(&self) -> AllocResult<Arc<FleetConfig>>;
}

/// In-memory configuration with atomic replacement
#[derive(Default)]
pub struct StaticConfigStore {
    current: ArcSwapOption<FleetConfig>,
}

impl StaticConfigStore {
    /// Create with an initial configuration
    pub fn new(config: FleetConfig) -> Self {
        Self {
            current: ArcSwapOption::from_pointee(config),
        }
    }

    /// Create with no configuration loaded
    pub fn empty() -> Self {
        Self::default()
    }

    /// Atomically replace the configuration
    pub fn set(&self, config: FleetConfig) {
        self.current.store(Some(Arc::new(config)));
    }

    /// Drop the configuration
    pub fn clear(&self) {
        self.current.store(None);
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn get(&self) -> AllocResult<Arc<FleetConfig>> {
        self.current
            .load_full()
            .ok_or_else(|| AllocError::ConfigurationMissing("no fleet configuration loaded".into()))
    }
}

/// JSON document re-read on every `get`
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path from `FLEET_CONFIG_PATH`, or the default location
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::new(path)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(&self) -> AllocResult<Arc<FleetConfig>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AllocError::ConfigurationMissing(format!(
                    "{} does not exist",
                    self.path.display()
                )));
            }
            Err(e) => {
                return Err(AllocError::Storage(format!("{}: {}", self.path.display(), e)));
            }
        };
        FleetConfig::from_json(&content).map(Arc::new)
    }
}
