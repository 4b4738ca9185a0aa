//! Relay and gateway roles over one network's node set.
//!
//! A [`Topology`] is loaded inside the network's mutation lock, edited in
//! memory and committed in the same transaction. Relay membership
//! (`relayed_nodes`) is authoritative: `relay_addrs` is always rebuilt from
//! the members' current addresses, never patched in place. Nothing here
//! publishes anything; [`Topology::commit`] hands back the changed records
//! for the caller to propagate.

use anyhow::Result;
use ipnet::IpNet;
use rusqlite::Connection;
use std::collections::BTreeSet;

use crate::error::{ControlError, ControlResult};
use crate::services::node_registry;
use crate::services::peers::find_relay_of;
use crate::types::{EgressGatewayRequest, Node};

pub struct Topology {
    nodes: Vec<Node>,
    dirty: BTreeSet<String>,
}

impl Topology {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            dirty: BTreeSet::new(),
        }
    }

    pub fn load(conn: &Connection, network: &str) -> Result<Self> {
        Ok(Self::new(node_registry::list_network_nodes(conn, network)?))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    fn require(&self, node_id: &str) -> ControlResult<&Node> {
        self.get(node_id)
            .ok_or_else(|| ControlError::NotFound(format!("node {} not found", node_id)))
    }

    /// Apply `f` to a node, marking it dirty if anything changed.
    pub fn modify<F>(&mut self, node_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Node),
    {
        let Some(node) = self.nodes.iter_mut().find(|n| n.id == node_id) else {
            return false;
        };
        let before = node.clone();
        f(node);
        if *node != before {
            self.dirty.insert(node_id.to_string());
            true
        } else {
            false
        }
    }

    /// Take a node out of the set. Its own record is not written on commit.
    pub fn remove(&mut self, node_id: &str) -> Option<Node> {
        let idx = self.nodes.iter().position(|n| n.id == node_id)?;
        self.dirty.remove(node_id);
        Some(self.nodes.remove(idx))
    }

    // ------------------------------------------------------------------------
    // Relays
    // ------------------------------------------------------------------------

    /// Rebuild `relay_addrs` of `relay_id` from its members' addresses.
    pub fn recompute_relay_addrs(&mut self, relay_id: &str) -> bool {
        let Some(relay) = self.get(relay_id) else {
            return false;
        };
        let mut addrs: Vec<String> = Vec::new();
        for member in &relay.relayed_nodes {
            if let Some(node) = self.get(member) {
                for addr in node.tunnel_addrs() {
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                }
            }
        }
        self.modify(relay_id, |r| r.relay_addrs = addrs)
    }

    /// Re-sync the relay fronting `node_id`, if any. Returns the relay's ID when
    /// its address list changed.
    pub fn repair_relay_for(&mut self, node_id: &str) -> Option<String> {
        let relay_id = find_relay_of(&self.nodes, node_id)?.id.clone();
        self.recompute_relay_addrs(&relay_id).then_some(relay_id)
    }

    fn check_members(&self, relay_id: &str, members: &[String]) -> ControlResult<()> {
        for member_id in members {
            if member_id == relay_id {
                return Err(ControlError::InvalidInput(
                    "a node cannot relay itself".into(),
                ));
            }
            let member = self.get(member_id).ok_or_else(|| {
                ControlError::InvalidInput(format!(
                    "node {} is not part of this network",
                    member_id
                ))
            })?;
            if member.is_relay {
                return Err(ControlError::InvalidInput(format!(
                    "node {} is a relay and cannot be relayed",
                    member_id
                )));
            }
            if let Some(other) = find_relay_of(&self.nodes, member_id) {
                if other.id != relay_id {
                    return Err(ControlError::InvalidInput(format!(
                        "node {} is already relayed by {}",
                        member_id, other.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Make `relay_id` the relay for exactly `members`.
    pub fn set_relay_members(&mut self, relay_id: &str, members: &[String]) -> ControlResult<()> {
        let relay = self.require(relay_id)?;
        if relay.is_relayed {
            return Err(ControlError::InvalidInput(
                "a relayed node cannot act as a relay".into(),
            ));
        }
        if members.is_empty() {
            return Err(ControlError::InvalidInput(
                "at least one relayed node is required".into(),
            ));
        }

        let mut wanted: Vec<String> = Vec::new();
        for m in members {
            if !wanted.contains(m) {
                wanted.push(m.clone());
            }
        }
        self.check_members(relay_id, &wanted)?;

        let previous = relay.relayed_nodes.clone();
        for dropped in previous.iter().filter(|id| !wanted.contains(id)) {
            self.modify(dropped, |n| n.is_relayed = false);
        }
        for member in &wanted {
            self.modify(member, |n| n.is_relayed = true);
        }
        self.modify(relay_id, |r| {
            r.is_relay = true;
            r.relayed_nodes = wanted.clone();
        });
        self.recompute_relay_addrs(relay_id);
        Ok(())
    }

    pub fn create_relay(&mut self, relay_id: &str, members: &[String]) -> ControlResult<()> {
        self.set_relay_members(relay_id, members)
    }

    pub fn delete_relay(&mut self, relay_id: &str) -> ControlResult<()> {
        let relay = self.require(relay_id)?;
        if !relay.is_relay {
            return Err(ControlError::InvalidState(format!(
                "node {} is not a relay",
                relay_id
            )));
        }
        for member in relay.relayed_nodes.clone() {
            self.modify(&member, |n| n.is_relayed = false);
        }
        self.modify(relay_id, |r| {
            r.is_relay = false;
            r.relayed_nodes.clear();
            r.relay_addrs.clear();
        });
        Ok(())
    }

    /// Re-derive a relay's membership from a requested address list.
    pub fn set_relay_addrs(&mut self, relay_id: &str, addrs: &[String]) -> ControlResult<()> {
        let mut members = Vec::new();
        for addr in addrs {
            let owner = self
                .nodes
                .iter()
                .find(|n| n.id != relay_id && n.tunnel_addrs().contains(addr))
                .ok_or_else(|| {
                    ControlError::InvalidInput(format!(
                        "no node in this network holds address {}",
                        addr
                    ))
                })?;
            if !members.contains(&owner.id) {
                members.push(owner.id.clone());
            }
        }

        if members.is_empty() {
            return self.delete_relay(relay_id);
        }
        self.set_relay_members(relay_id, &members)
    }

    /// Unlink a node that is about to be deleted from every relay relationship.
    pub fn detach(&mut self, node_id: &str) {
        if let Some(relay_id) = find_relay_of(&self.nodes, node_id).map(|r| r.id.clone()) {
            let id = node_id.to_string();
            self.modify(&relay_id, |r| {
                r.relayed_nodes.retain(|m| *m != id);
                if r.relayed_nodes.is_empty() {
                    r.is_relay = false;
                }
            });
            self.recompute_relay_addrs(&relay_id);
        }

        let members = self
            .get(node_id)
            .filter(|n| n.is_relay)
            .map(|n| n.relayed_nodes.clone())
            .unwrap_or_default();
        for member in members {
            self.modify(&member, |n| n.is_relayed = false);
        }
    }

    // ------------------------------------------------------------------------
    // Gateways
    // ------------------------------------------------------------------------

    pub fn create_egress(&mut self, node_id: &str, req: &EgressGatewayRequest) -> ControlResult<()> {
        self.require(node_id)?;
        if req.ranges.is_empty() {
            return Err(ControlError::InvalidInput(
                "at least one egress range is required".into(),
            ));
        }
        let mut ranges = Vec::with_capacity(req.ranges.len());
        for raw in &req.ranges {
            let net: IpNet = raw.trim().parse().map_err(|_| {
                ControlError::InvalidInput(format!("invalid egress range: {}", raw))
            })?;
            let net = net.trunc().to_string();
            if !ranges.contains(&net) {
                ranges.push(net);
            }
        }

        let interface = req.interface.clone().filter(|i| !i.is_empty());
        self.modify(node_id, |n| {
            n.is_egress = true;
            n.egress_ranges = ranges;
            n.egress_interface = interface;
        });
        Ok(())
    }

    pub fn delete_egress(&mut self, node_id: &str) -> ControlResult<()> {
        self.require(node_id)?;
        self.modify(node_id, |n| {
            n.is_egress = false;
            n.egress_ranges.clear();
            n.egress_interface = None;
        });
        Ok(())
    }

    pub fn create_ingress(&mut self, node_id: &str) -> ControlResult<()> {
        self.require(node_id)?;
        self.modify(node_id, |n| n.is_ingress = true);
        Ok(())
    }

    pub fn delete_ingress(&mut self, node_id: &str) -> ControlResult<()> {
        self.require(node_id)?;
        self.modify(node_id, |n| n.is_ingress = false);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn is_dirty(&self, node_id: &str) -> bool {
        self.dirty.contains(node_id)
    }

    /// Write every changed record, stamping `last_modified`, and return them.
    pub fn commit(mut self, conn: &Connection, now: i64) -> Result<Vec<Node>> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut changed = Vec::new();
        for node in self.nodes.iter_mut().filter(|n| dirty.contains(&n.id)) {
            node.last_modified = now;
            node_registry::write_node(conn, node)?;
            changed.push(node.clone());
        }
        Ok(changed)
    }
}
