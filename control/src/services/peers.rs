//! Peer-list computation and server lookups over a network's node set.

use std::net::IpAddr;

use crate::types::{Node, NodeAction, PeerEntry};

/// The relay whose membership contains `node_id`.
pub fn find_relay_of<'a>(nodes: &'a [Node], node_id: &str) -> Option<&'a Node> {
    nodes
        .iter()
        .find(|n| n.is_relay && n.relayed_nodes.iter().any(|m| m == node_id))
}

/// Leader of a network: the server node with the lowest IPv4 address.
///
/// Servers without an address sort last; ties fall back to the node ID.
pub fn find_leader(nodes: &[Node]) -> Option<&Node> {
    nodes
        .iter()
        .filter(|n| n.is_server)
        .min_by_key(|n| (n.address.is_none(), n.address, n.id.clone()))
}

/// This control plane's own server record in a network.
pub fn find_local_server<'a>(nodes: &'a [Node], server_name: &str) -> Option<&'a Node> {
    nodes.iter().find(|n| n.is_server && n.name == server_name)
}

fn host_cidr(addr: &str) -> String {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(a)) => format!("{}/32", a),
        Ok(IpAddr::V6(a)) => format!("{}/128", a),
        Err(_) => addr.to_string(),
    }
}

pub fn peer_entry(peer: &Node) -> PeerEntry {
    let mut allowed_ips: Vec<String> = peer.tunnel_addrs().iter().map(|a| host_cidr(a)).collect();
    if peer.is_relay {
        allowed_ips.extend(peer.relay_addrs.iter().map(|a| host_cidr(a)));
    }
    if peer.is_egress {
        allowed_ips.extend(peer.egress_ranges.iter().cloned());
    }

    PeerEntry {
        id: peer.id.clone(),
        name: peer.name.clone(),
        public_key: peer.public_key.clone(),
        endpoint: peer.endpoint.clone(),
        listen_port: peer.listen_port,
        persistent_keepalive: peer.persistent_keepalive,
        allowed_ips,
    }
}

/// A node can be configured as a peer once it is active and has reported a key.
fn reachable(candidate: &Node) -> bool {
    !candidate.is_pending
        && candidate.action != NodeAction::Delete
        && !candidate.public_key.is_empty()
}

/// Peers `node` should configure, given every node of its network.
pub fn compute_peers(node: &Node, network_nodes: &[Node]) -> Vec<PeerEntry> {
    if node.is_pending {
        return Vec::new();
    }

    if node.is_relayed {
        return find_relay_of(network_nodes, &node.id)
            .filter(|relay| relay.id != node.id && reachable(relay))
            .map(|relay| vec![peer_entry(relay)])
            .unwrap_or_default();
    }

    network_nodes
        .iter()
        .filter(|c| c.id != node.id && reachable(c))
        .filter(|c| !c.is_relayed || node.relayed_nodes.contains(&c.id))
        .map(peer_entry)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::node_registry::fixtures::node;

    fn ids(peers: &[PeerEntry]) -> Vec<&str> {
        peers.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_pending_and_deleting_nodes_are_excluded() {
        let a = node("a", "n1", "10.0.0.1");
        let mut b = node("b", "n1", "10.0.0.2");
        b.is_pending = true;
        let mut c = node("c", "n1", "10.0.0.3");
        c.action = NodeAction::Delete;
        let d = node("d", "n1", "10.0.0.4");
        let nodes = vec![a.clone(), b.clone(), c, d];

        assert_eq!(ids(&compute_peers(&a, &nodes)), vec!["d"]);
        assert!(compute_peers(&b, &nodes).is_empty());
    }

    #[test]
    fn test_keyless_nodes_are_not_offered_as_peers() {
        let a = node("a", "n1", "10.0.0.2");
        let mut srv = node("srv", "n1", "10.0.0.1");
        srv.is_server = true;
        srv.public_key = String::new();
        let b = node("b", "n1", "10.0.0.3");
        let nodes = vec![srv.clone(), a.clone(), b];

        assert_eq!(ids(&compute_peers(&a, &nodes)), vec!["b"]);
        // The keyless node itself still receives its peers
        assert_eq!(ids(&compute_peers(&srv, &nodes)), vec!["a", "b"]);
    }

    #[test]
    fn test_relayed_nodes_are_reached_through_their_relay() {
        let a = node("a", "n1", "10.0.0.1");
        let mut r = node("r", "n1", "10.0.0.5");
        r.is_relay = true;
        r.relayed_nodes = vec!["x".into()];
        r.relay_addrs = vec!["10.0.0.2".into()];
        let mut x = node("x", "n1", "10.0.0.2");
        x.is_relayed = true;
        let nodes = vec![a.clone(), r.clone(), x.clone()];

        assert_eq!(ids(&compute_peers(&a, &nodes)), vec!["r"]);
        assert_eq!(ids(&compute_peers(&r, &nodes)), vec!["a", "x"]);
        assert_eq!(ids(&compute_peers(&x, &nodes)), vec!["r"]);

        let relay_entry = compute_peers(&a, &nodes).remove(0);
        assert_eq!(relay_entry.allowed_ips, vec!["10.0.0.5/32", "10.0.0.2/32"]);
    }

    #[test]
    fn test_egress_ranges_in_allowed_ips() {
        let a = node("a", "n1", "10.0.0.1");
        let mut g = node("g", "n1", "10.0.0.7");
        g.address6 = Some("fd00::7".parse().unwrap());
        g.is_egress = true;
        g.egress_ranges = vec!["192.168.10.0/24".into()];

        let peers = compute_peers(&a, &[a.clone(), g]);
        assert_eq!(
            peers[0].allowed_ips,
            vec!["10.0.0.7/32", "fd00::7/128", "192.168.10.0/24"]
        );
    }

    #[test]
    fn test_leader_is_lowest_addressed_server() {
        let mut s1 = node("s1", "n1", "10.0.0.9");
        s1.is_server = true;
        let mut s2 = node("s2", "n1", "10.0.0.3");
        s2.is_server = true;
        s2.name = "netmesh-server".into();
        let mut s3 = node("s3", "n1", "10.0.0.1");
        s3.is_server = true;
        s3.address = None;
        let plain = node("p", "n1", "10.0.0.1");
        let nodes = vec![s1, s2, s3, plain];

        assert_eq!(find_leader(&nodes).unwrap().id, "s2");
        assert_eq!(find_local_server(&nodes, "netmesh-server").unwrap().id, "s2");
        assert!(find_local_server(&nodes, "other").is_none());
        assert!(find_leader(&nodes[3..]).is_none());
    }
}
