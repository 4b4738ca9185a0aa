use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

// ============================================================================
// Node Types
// ============================================================================

/// Pending action marker carried on a node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAction {
    #[default]
    None,
    Delete,
}

impl NodeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::None => "none",
            NodeAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delete" => NodeAction::Delete,
            _ => NodeAction::None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficKeys {
    pub mine: Option<String>,
    pub server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub network: String,
    pub address: Option<Ipv4Addr>,
    pub address6: Option<Ipv6Addr>,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
    pub persistent_keepalive: Option<u32>,
    pub mac_address: Option<String>,
    pub is_server: bool,
    pub is_pending: bool,
    pub is_relay: bool,
    pub is_relayed: bool,
    /// Tunnel addresses of the nodes this relay fronts. Derived from `relayed_nodes`.
    pub relay_addrs: Vec<String>,
    pub relayed_nodes: Vec<String>,
    pub is_ingress: bool,
    pub is_egress: bool,
    pub egress_ranges: Vec<String>,
    pub egress_interface: Option<String>,
    pub pre_up: String,
    pub pre_down: String,
    pub traffic_keys: TrafficKeys,
    pub action: NodeAction,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: i64,
    pub last_modified: i64,
}

impl Node {
    /// Tunnel addresses of this node rendered as strings, v4 first.
    pub fn tunnel_addrs(&self) -> Vec<String> {
        let mut addrs = Vec::new();
        if let Some(a) = self.address {
            addrs.push(a.to_string());
        }
        if let Some(a) = self.address6 {
            addrs.push(a.to_string());
        }
        addrs
    }
}

/// Registration body sent by a joining node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDraft {
    pub name: Option<String>,
    #[serde(default)]
    pub public_key: String,
    pub address: Option<Ipv4Addr>,
    pub address6: Option<Ipv6Addr>,
    pub endpoint: Option<String>,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
    pub persistent_keepalive: Option<u32>,
    pub password: Option<String>,
    pub macaddress: Option<String>,
    #[serde(default)]
    pub traffic_keys: TrafficKeys,
    pub access_key: Option<String>,
    pub pre_up: Option<String>,
    pub pre_down: Option<String>,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePatch {
    pub name: Option<String>,
    pub public_key: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub address6: Option<Ipv6Addr>,
    pub endpoint: Option<String>,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
    pub persistent_keepalive: Option<u32>,
    pub mac_address: Option<String>,
    pub relay_addrs: Option<Vec<String>>,
    pub pre_up: Option<String>,
    pub pre_down: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub relayed_nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressGatewayRequest {
    pub ranges: Vec<String>,
    pub interface: Option<String>,
}

// ============================================================================
// Peer Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: String,
    pub name: String,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub listen_port: Option<u16>,
    pub persistent_keepalive: Option<u32>,
    pub allowed_ips: Vec<String>,
}

/// Server metadata handed to nodes alongside their peer list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub api_endpoint: Option<String>,
    pub broker_endpoint: Option<String>,
    pub traffic_key: Option<String>,
    pub client_mode: bool,
    pub dns_mode: bool,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGet {
    pub node: Node,
    pub peers: Vec<PeerEntry>,
    pub server_config: ServerInfo,
}

/// Peer-list update addressed to a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub node_id: String,
    pub network: String,
    pub action: NodeAction,
    pub peers: Vec<PeerEntry>,
    pub server: ServerInfo,
}

/// Configuration reload pushed to a server node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerReload {
    pub server_node_id: String,
    pub network: String,
    pub interface_changed: bool,
}

// ============================================================================
// Network Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub address_range: Option<Ipv4Net>,
    pub address_range6: Option<Ipv6Net>,
    pub allow_manual_signup: bool,
    pub default_listen_port: Option<u16>,
    pub nodes_last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessKey {
    pub name: String,
    pub value: String,
    /// Remaining registrations this key may authorize.
    pub uses: i64,
}

// ============================================================================
// Auth Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(skip)]
    pub password_hash: String,
    pub is_admin: bool,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthParams {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub password: String,
    pub macaddress: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAuthParams {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub auth_token: String,
    pub id: String,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
