use anyhow::Result;
use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::types::Node;

/// Tunnel address allocator for one network.
///
/// Built from the network's ranges and the addresses its nodes currently hold.
pub struct NetworkIpam {
    range: Option<Ipv4Net>,
    range6: Option<Ipv6Net>,
    used: HashSet<Ipv4Addr>,
    used6: HashSet<Ipv6Addr>,
}

impl NetworkIpam {
    pub fn new(range: Option<Ipv4Net>, range6: Option<Ipv6Net>, nodes: &[Node]) -> Self {
        Self {
            range,
            range6,
            used: nodes.iter().filter_map(|n| n.address).collect(),
            used6: nodes.iter().filter_map(|n| n.address6).collect(),
        }
    }

    /// Forget the addresses held by `node`, so its own update can keep them.
    pub fn without(mut self, node: &Node) -> Self {
        if let Some(a) = node.address {
            self.used.remove(&a);
        }
        if let Some(a) = node.address6 {
            self.used6.remove(&a);
        }
        self
    }

    /// Allocate the lowest free host address in the IPv4 range
    pub fn allocate(&mut self) -> Result<Option<Ipv4Addr>> {
        let Some(range) = self.range else {
            return Ok(None);
        };

        match range.hosts().find(|a| !self.used.contains(a)) {
            Some(addr) => {
                self.used.insert(addr);
                Ok(Some(addr))
            }
            None => anyhow::bail!("Exhausted address range {}", range),
        }
    }

    /// Allocate the lowest free host address in the IPv6 range
    pub fn allocate6(&mut self) -> Result<Option<Ipv6Addr>> {
        let Some(range) = self.range6 else {
            return Ok(None);
        };

        // Skip the subnet-router anycast address.
        match range
            .hosts()
            .skip(1)
            .find(|a| !self.used6.contains(a))
        {
            Some(addr) => {
                self.used6.insert(addr);
                Ok(Some(addr))
            }
            None => anyhow::bail!("Exhausted address range {}", range),
        }
    }

    /// Check that a requested IPv4 address is inside the range and unused
    pub fn check(&self, addr: Ipv4Addr) -> std::result::Result<(), String> {
        if let Some(range) = self.range {
            if !range.contains(&addr) {
                return Err(format!("address {} is outside {}", addr, range));
            }
        }
        if self.used.contains(&addr) {
            return Err(format!("address {} is already in use", addr));
        }
        Ok(())
    }

    /// Check that a requested IPv6 address is inside the range and unused
    pub fn check6(&self, addr: Ipv6Addr) -> std::result::Result<(), String> {
        if let Some(range) = self.range6 {
            if !range.contains(&addr) {
                return Err(format!("address {} is outside {}", addr, range));
            }
        }
        if self.used6.contains(&addr) {
            return Err(format!("address {} is already in use", addr));
        }
        Ok(())
    }
}
