//! Aggregates - PoPs, hosts and the resources assigned to them
//!
//! A PoP owns its hosts; a host carries exactly one /48 prefix which is
//! fixed when the host is created.

use super::value_objects::*;
use ipnetwork::Ipv6Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IPv4/IPv6 pair derived from one host slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressPair {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

impl fmt::Display for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ipv4, self.ipv6)
    }
}

/// Address pair claimed by a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedAddress {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub owner: OwnerId,
}

impl AssignedAddress {
    pub fn new(pair: AddressPair, owner: OwnerId) -> Self {
        Self {
            ipv4: pair.ipv4,
            ipv6: pair.ipv6,
            owner,
        }
    }

    pub fn pair(&self) -> AddressPair {
        AddressPair {
            ipv4: self.ipv4,
            ipv6: self.ipv6,
        }
    }
}

/// /48 prefix claimed by a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedPrefix {
    pub prefix: Ipv6Network,
    pub pop: PopName,
    pub owner: HostId,
}

/// Caller-supplied attributes of a host about to be provisioned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// Management address of the machine
    pub ip: IpAddr,
}

/// Host entity (owned by a PoP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    id: HostId,
    pop: PopName,
    ip: IpAddr,
    prefix: Ipv6Network,
}

impl Host {
    /// Create a host with its assigned prefix
    pub fn new(pop: PopName, spec: HostSpec, prefix: Ipv6Network) -> Self {
        Self {
            id: HostId::generate(),
            pop,
            ip: spec.ip,
            prefix,
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn pop(&self) -> &PopName {
        &self.pop
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn prefix(&self) -> Ipv6Network {
        self.prefix
    }

    /// Prefix record held by this host
    pub fn assigned_prefix(&self) -> AssignedPrefix {
        AssignedPrefix {
            prefix: self.prefix,
            pop: self.pop.clone(),
            owner: self.id,
        }
    }
}

/// PoP Aggregate Root
///
/// # Invariants
/// - Every host belongs to this PoP
/// - Host IDs are unique within the PoP
/// - Hosts keep insertion order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pop {
    name: PopName,
    hosts: Vec<Host>,
}

impl Pop {
    /// Create an empty PoP
    pub fn new(name: PopName) -> Self {
        Self {
            name,
            hosts: Vec::new(),
        }
    }

    pub fn name(&self) -> &PopName {
        &self.name
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Append a host (maintains invariants)
    pub fn add_host(&mut self, host: Host) -> Result<(), DomainError> {
        if host.pop != self.name {
            return Err(DomainError::InvariantViolation(format!(
                "host {} belongs to {}, not {}",
                host.id, host.pop, self.name
            )));
        }
        if self.hosts.iter().any(|h| h.id == host.id) {
            return Err(DomainError::InvariantViolation(format!(
                "duplicate host {}",
                host.id
            )));
        }
        self.hosts.push(host);
        Ok(())
    }

    /// Detach a host, returning it if present
    pub fn remove_host(&mut self, id: HostId) -> Option<Host> {
        let idx = self.hosts.iter().position(|h| h.id == id)?;
        Some(self.hosts.remove(idx))
    }

    /// Prefixes held by this PoP's hosts
    pub fn prefixes(&self) -> impl Iterator<Item = Ipv6Network> + '_ {
        self.hosts.iter().map(|h| h.prefix)
    }
}
