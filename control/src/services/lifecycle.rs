//! Node lifecycle: registration, approval, updates, deletion and the
//! read-side queries, plus the two bootstrap logins.
//!
//! Every mutation takes the network lock, runs its reads and writes in one
//! transaction, and only then hands the affected records to the propagator.

use anyhow::Context;
use rand::{distributions::Alphanumeric, Rng};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{execute_async, transact_async, DbPool};
use crate::error::{ControlError, ControlResult};
use crate::services::authorization::RequestContext;
use crate::services::bus::DnsHook;
use crate::services::credentials::{Identity, SecretHasher, TokenSigner};
use crate::services::ipam::NetworkIpam;
use crate::services::locks::NetworkLocks;
use crate::services::peers::compute_peers;
use crate::services::propagation::Propagator;
use crate::services::topology::Topology;
use crate::services::{network_registry, node_registry, user_registry};
use crate::types::{
    AuthParams, EgressGatewayRequest, LoginResponse, Network, Node, NodeAction, NodeDraft,
    NodeGet, NodePatch, TrafficKeys, UserAuthParams,
};

#[derive(Debug, Clone, Default)]
pub struct LifecycleSettings {
    pub allow_remote_exec: bool,
    pub dns_mode: bool,
    pub server_traffic_key: Option<String>,
}

pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn same_set(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Whether the change from `old` to `new` requires the node's interface to
/// be reconfigured.
pub fn interface_changed(old: &Node, new: &Node) -> bool {
    old.public_key != new.public_key
        || old.endpoint != new.endpoint
        || old.address != new.address
        || old.address6 != new.address6
        || old.listen_port != new.listen_port
        || old.mtu != new.mtu
        || old.persistent_keepalive != new.persistent_keepalive
        || old.pre_up != new.pre_up
        || old.pre_down != new.pre_down
        || old.is_relay != new.is_relay
        || !same_set(&old.relay_addrs, &new.relay_addrs)
        || old.is_egress != new.is_egress
        || !same_set(&old.egress_ranges, &new.egress_ranges)
}

/// Random alphanumeric secret for generated passwords and signing keys.
pub fn random_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn require_network(conn: &rusqlite::Connection, name: &str) -> ControlResult<Network> {
    network_registry::find_network(conn, name)?
        .ok_or_else(|| ControlError::NotFound(format!("network {} does not exist", name)))
}

fn node_not_found(node_id: &str) -> ControlError {
    ControlError::NotFound(format!("node {} not found", node_id))
}

/// Result of an update, handed from the transaction to propagation.
struct UpdateOutcome {
    node: Node,
    others: Vec<Node>,
    fronted: Vec<Node>,
    relay_changed: bool,
    repaired_relay: Option<String>,
    interface_changed: bool,
}

pub struct NodeLifecycle {
    db: DbPool,
    locks: NetworkLocks,
    hasher: Arc<dyn SecretHasher>,
    signer: Arc<dyn TokenSigner>,
    propagator: Propagator,
    dns: Arc<dyn DnsHook>,
    settings: LifecycleSettings,
}

impl NodeLifecycle {
    pub fn new(
        db: DbPool,
        hasher: Arc<dyn SecretHasher>,
        signer: Arc<dyn TokenSigner>,
        propagator: Propagator,
        dns: Arc<dyn DnsHook>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            db,
            locks: NetworkLocks::new(),
            hasher,
            signer,
            propagator,
            dns,
            settings,
        }
    }

    pub fn propagator(&self) -> &Propagator {
        &self.propagator
    }

    /// Take the network lock, refusing names that are not in the database so
    /// unknown networks never get a lock entry.
    async fn lock_network(&self, network: &str) -> ControlResult<OwnedMutexGuard<()>> {
        let network_name = network.to_string();
        let exists = execute_async(&self.db, move |conn| {
            network_registry::network_exists(conn, &network_name)
        })
        .await?;
        if !exists {
            return Err(ControlError::NotFound(format!(
                "network {} does not exist",
                network
            )));
        }
        Ok(self.locks.lock(network).await)
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub async fn register(
        &self,
        network: &str,
        bearer_key: Option<String>,
        draft: NodeDraft,
    ) -> ControlResult<NodeGet> {
        let _guard = self.lock_network(network).await?;

        let access_key = draft
            .access_key
            .clone()
            .filter(|k| !k.is_empty())
            .or(bearer_key)
            .unwrap_or_default();
        let network_name = network.to_string();
        let hasher = self.hasher.clone();
        let server_key = self.settings.server_traffic_key.clone();
        let now = unix_now();

        let (node, nodes) = transact_async(&self.db, move |conn| {
            let network = require_network(conn, &network_name)?;

            let server_key = server_key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| ControlError::InvalidState("server traffic key is not configured".into()))?;
            let node_key = draft
                .traffic_keys
                .mine
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| ControlError::InvalidState("node traffic key is missing".into()))?;

            let key_accepted = network_registry::consume_access_key(conn, &network.name, &access_key)?;
            if !key_accepted && !network.allow_manual_signup {
                return Err(ControlError::Unauthorized("invalid access key".into()));
            }

            if draft.public_key.trim().is_empty() {
                return Err(ControlError::InvalidInput("public key is required".into()));
            }

            let existing = node_registry::list_network_nodes(conn, &network.name)?;
            let mut ipam = NetworkIpam::new(network.address_range, network.address_range6, &existing);
            let address = match draft.address {
                Some(addr) => {
                    ipam.check(addr).map_err(ControlError::InvalidInput)?;
                    Some(addr)
                }
                None => ipam
                    .allocate()
                    .map_err(|e| ControlError::InvalidState(e.to_string()))?,
            };
            let address6 = match draft.address6 {
                Some(addr) => {
                    ipam.check6(addr).map_err(ControlError::InvalidInput)?;
                    Some(addr)
                }
                None => ipam
                    .allocate6()
                    .map_err(|e| ControlError::InvalidState(e.to_string()))?,
            };

            let password = draft
                .password
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(random_secret);
            let password_hash = hasher.hash(&password)?;

            let id = Uuid::new_v4().to_string();
            let node = Node {
                name: draft
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| format!("node-{}", &id[..8])),
                id,
                network: network.name.clone(),
                address,
                address6,
                public_key: draft.public_key.trim().to_string(),
                endpoint: draft.endpoint.clone(),
                listen_port: draft.listen_port.or(network.default_listen_port),
                mtu: draft.mtu,
                persistent_keepalive: draft.persistent_keepalive,
                mac_address: draft.macaddress.clone(),
                is_server: false,
                is_pending: !key_accepted,
                is_relay: false,
                is_relayed: false,
                relay_addrs: Vec::new(),
                relayed_nodes: Vec::new(),
                is_ingress: false,
                is_egress: false,
                egress_ranges: Vec::new(),
                egress_interface: None,
                pre_up: draft.pre_up.clone().unwrap_or_default(),
                pre_down: draft.pre_down.clone().unwrap_or_default(),
                traffic_keys: TrafficKeys {
                    mine: Some(node_key),
                    server: Some(server_key),
                },
                action: NodeAction::None,
                password_hash,
                created_at: now,
                last_modified: now,
            };

            node_registry::insert_node(conn, &node)?;
            network_registry::touch_network(conn, &network.name, now)?;

            let mut nodes = existing;
            nodes.push(node.clone());
            Ok::<_, ControlError>((node, nodes))
        })
        .await?;

        info!(
            "Registered node {} ({}) in network {} pending={}",
            node.id, node.name, node.network, node.is_pending
        );

        let peers = compute_peers(&node, &nodes);
        self.propagator.force_propagate(node.clone());

        Ok(NodeGet {
            node,
            peers,
            server_config: self.propagator.server_info().clone(),
        })
    }

    /// Insert this control plane's own server node into `network` if absent.
    pub async fn ensure_server_node(&self, network: &str, server_name: &str) -> ControlResult<Option<Node>> {
        let _guard = self.lock_network(network).await?;

        let network_name = network.to_string();
        let server_name = server_name.to_string();
        let traffic_key = self.settings.server_traffic_key.clone();
        let hasher = self.hasher.clone();
        let now = unix_now();

        let created = transact_async(&self.db, move |conn| {
            let network = require_network(conn, &network_name)?;
            let existing = node_registry::list_network_nodes(conn, &network.name)?;
            if existing.iter().any(|n| n.is_server && n.name == server_name) {
                return Ok::<_, ControlError>(None);
            }

            let mut ipam = NetworkIpam::new(network.address_range, network.address_range6, &existing);
            let node = Node {
                id: Uuid::new_v4().to_string(),
                name: server_name,
                network: network.name.clone(),
                address: ipam.allocate().map_err(|e| ControlError::InvalidState(e.to_string()))?,
                address6: ipam.allocate6().map_err(|e| ControlError::InvalidState(e.to_string()))?,
                public_key: String::new(),
                endpoint: None,
                listen_port: network.default_listen_port,
                mtu: None,
                persistent_keepalive: None,
                mac_address: None,
                is_server: true,
                is_pending: false,
                is_relay: false,
                is_relayed: false,
                relay_addrs: Vec::new(),
                relayed_nodes: Vec::new(),
                is_ingress: false,
                is_egress: false,
                egress_ranges: Vec::new(),
                egress_interface: None,
                pre_up: String::new(),
                pre_down: String::new(),
                traffic_keys: TrafficKeys {
                    mine: traffic_key.clone(),
                    server: traffic_key,
                },
                action: NodeAction::None,
                password_hash: hasher.hash(&random_secret())?,
                created_at: now,
                last_modified: now,
            };
            node_registry::insert_node(conn, &node)?;
            network_registry::touch_network(conn, &network.name, now)?;
            Ok(Some(node))
        })
        .await?;

        if let Some(node) = &created {
            info!("Created server node {} in network {}", node.id, node.network);
            self.propagator.force_propagate(node.clone());
        }
        Ok(created)
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    pub async fn approve(&self, network: &str, node_id: &str) -> ControlResult<Node> {
        let _guard = self.lock_network(network).await?;

        let network_name = network.to_string();
        let id = node_id.to_string();
        let now = unix_now();
        let node = transact_async(&self.db, move |conn| {
            let mut node = node_registry::find_node(conn, &id)?
                .filter(|n| n.network == network_name)
                .ok_or_else(|| node_not_found(&id))?;
            node.is_pending = false;
            node.last_modified = now;
            node_registry::write_node(conn, &node)?;
            network_registry::touch_network(conn, &network_name, now)?;
            Ok::<_, ControlError>(node)
        })
        .await?;

        info!("Approved node {} in network {}", node.id, node.network);
        self.propagator.propagate(node.clone(), true);
        Ok(node)
    }

    pub async fn update(&self, network: &str, node_id: &str, patch: NodePatch) -> ControlResult<Node> {
        let _guard = self.lock_network(network).await?;

        let network_name = network.to_string();
        let id = node_id.to_string();
        let hasher = self.hasher.clone();
        let allow_remote_exec = self.settings.allow_remote_exec;
        let now = unix_now();

        let outcome = transact_async(&self.db, move |conn| {
            let net = require_network(conn, &network_name)?;
            let mut topo = Topology::load(conn, &net.name)?;
            let current = topo.get(&id).cloned().ok_or_else(|| node_not_found(&id))?;

            let ipam = NetworkIpam::new(net.address_range, net.address_range6, topo.nodes())
                .without(&current);
            if let Some(addr) = patch.address.filter(|a| Some(*a) != current.address) {
                ipam.check(addr).map_err(ControlError::InvalidInput)?;
            }
            if let Some(addr) = patch.address6.filter(|a| Some(*a) != current.address6) {
                ipam.check6(addr).map_err(ControlError::InvalidInput)?;
            }

            let relay_changed = current.is_relay
                && patch
                    .relay_addrs
                    .as_ref()
                    .is_some_and(|addrs| !same_set(addrs, &current.relay_addrs));
            let address_changed = patch.address.is_some_and(|a| Some(a) != current.address)
                || patch.address6.is_some_and(|a| Some(a) != current.address6);
            let relayed_changed = current.is_relayed && address_changed;

            let password_hash = match patch.password.as_deref().filter(|p| !p.is_empty()) {
                Some(p) => Some(hasher.hash(p)?),
                None => None,
            };
            if !allow_remote_exec && (patch.pre_up.is_some() || patch.pre_down.is_some()) {
                warn!("Ignoring script change for node {}: remote exec disabled", id);
            }

            topo.modify(&id, |n| {
                if let Some(v) = patch.name.clone().filter(|v| !v.is_empty()) {
                    n.name = v;
                }
                if let Some(v) = patch.public_key.clone().filter(|v| !v.is_empty()) {
                    n.public_key = v;
                }
                if let Some(v) = patch.address {
                    n.address = Some(v);
                }
                if let Some(v) = patch.address6 {
                    n.address6 = Some(v);
                }
                if let Some(v) = patch.endpoint.clone() {
                    n.endpoint = Some(v);
                }
                if let Some(v) = patch.listen_port {
                    n.listen_port = Some(v);
                }
                if let Some(v) = patch.mtu {
                    n.mtu = Some(v);
                }
                if let Some(v) = patch.persistent_keepalive {
                    n.persistent_keepalive = Some(v);
                }
                if let Some(v) = patch.mac_address.clone() {
                    n.mac_address = Some(v);
                }
                if allow_remote_exec {
                    if let Some(v) = patch.pre_up.clone() {
                        n.pre_up = v;
                    }
                    if let Some(v) = patch.pre_down.clone() {
                        n.pre_down = v;
                    }
                }
                if let Some(h) = password_hash {
                    n.password_hash = h;
                }
            });

            if relay_changed {
                let addrs = patch.relay_addrs.clone().unwrap_or_default();
                topo.set_relay_addrs(&id, &addrs)?;
            }
            let repaired_relay = if relayed_changed {
                topo.repair_relay_for(&id)
            } else {
                None
            };

            let updated = topo.get(&id).cloned().ok_or_else(|| node_not_found(&id))?;
            let iface = interface_changed(&current, &updated);
            let mut relay_members = current.relayed_nodes.clone();
            for m in &updated.relayed_nodes {
                if !relay_members.contains(m) {
                    relay_members.push(m.clone());
                }
            }

            let fronted: Vec<Node> = if relay_changed {
                relay_members.iter().filter_map(|m| topo.get(m).cloned()).collect()
            } else {
                Vec::new()
            };

            let changed = topo.commit(conn, now)?;
            network_registry::touch_network(conn, &net.name, now)?;

            let fronted = fronted
                .into_iter()
                .map(|f| changed.iter().find(|n| n.id == f.id).cloned().unwrap_or(f))
                .collect();
            let node = changed
                .iter()
                .find(|n| n.id == id)
                .cloned()
                .unwrap_or(updated);
            let others = changed.into_iter().filter(|n| n.id != id).collect();

            Ok::<_, ControlError>(UpdateOutcome {
                node,
                others,
                fronted,
                relay_changed,
                repaired_relay,
                interface_changed: iface,
            })
        })
        .await?;

        let UpdateOutcome {
            node,
            others,
            fronted,
            relay_changed,
            repaired_relay,
            interface_changed,
        } = outcome;

        if relay_changed {
            for member in fronted {
                self.propagator.propagate(member, false);
            }
        }
        if let Some(relay_id) = &repaired_relay {
            if let Some(relay) = others.iter().find(|n| &n.id == relay_id) {
                info!("Repaired relay {} after address change of {}", relay.id, node.id);
                self.propagator.propagate(relay.clone(), true);
            }
        }
        if self.settings.dns_mode {
            if let Err(e) = self.dns.regenerate(&node.network).await {
                warn!("DNS regeneration for {} failed: {:#}", node.network, e);
            }
        }

        self.propagator.propagate(node.clone(), interface_changed);
        Ok(node)
    }

    pub async fn delete(&self, network: &str, node_id: &str) -> ControlResult<Node> {
        let _guard = self.lock_network(network).await?;

        let network_name = network.to_string();
        let id = node_id.to_string();
        let now = unix_now();

        let (removed, others) = transact_async(&self.db, move |conn| {
            let mut topo = Topology::load(conn, &network_name)?;
            let current = topo.get(&id).cloned().ok_or_else(|| node_not_found(&id))?;
            if current.is_server {
                return Err(ControlError::InvalidState(
                    "server nodes cannot be deleted".into(),
                ));
            }

            let mut marked = current;
            marked.action = NodeAction::Delete;
            marked.last_modified = now;
            node_registry::write_node(conn, &marked)?;

            topo.detach(&id);
            topo.remove(&id);
            node_registry::delete_node(conn, &id)?;

            let others = topo.commit(conn, now)?;
            network_registry::touch_network(conn, &network_name, now)?;
            Ok::<_, ControlError>((marked, others))
        })
        .await?;

        info!("Deleted node {} from network {}", removed.id, removed.network);
        for other in &others {
            self.propagator.propagate(other.clone(), true);
        }
        self.propagator.force_propagate(removed.clone());
        Ok(removed)
    }

    // ========================================================================
    // Topology roles
    // ========================================================================

    async fn with_topology<F>(&self, network: &str, node_id: &str, what: &'static str, f: F) -> ControlResult<Node>
    where
        F: FnOnce(&mut Topology, &str) -> ControlResult<()> + Send + 'static,
    {
        let _guard = self.lock_network(network).await?;

        let network_name = network.to_string();
        let id = node_id.to_string();
        let now = unix_now();

        let (node, changed) = transact_async(&self.db, move |conn| {
            let mut topo = Topology::load(conn, &network_name)?;
            let current = topo.get(&id).cloned().ok_or_else(|| node_not_found(&id))?;
            f(&mut topo, &id)?;
            let changed = topo.commit(conn, now)?;
            if !changed.is_empty() {
                network_registry::touch_network(conn, &network_name, now)?;
            }
            let node = changed
                .iter()
                .find(|n| n.id == id)
                .cloned()
                .unwrap_or(current);
            Ok::<_, ControlError>((node, changed))
        })
        .await?;

        info!("{} on node {} in network {}", what, node.id, node.network);
        for n in changed {
            self.propagator.propagate(n, true);
        }
        Ok(node)
    }

    pub async fn create_relay(&self, network: &str, node_id: &str, members: Vec<String>) -> ControlResult<Node> {
        self.with_topology(network, node_id, "Created relay", move |topo, id| {
            topo.create_relay(id, &members)
        })
        .await
    }

    pub async fn delete_relay(&self, network: &str, node_id: &str) -> ControlResult<Node> {
        self.with_topology(network, node_id, "Deleted relay", |topo, id| topo.delete_relay(id))
            .await
    }

    pub async fn create_egress(&self, network: &str, node_id: &str, req: EgressGatewayRequest) -> ControlResult<Node> {
        self.with_topology(network, node_id, "Created egress gateway", move |topo, id| {
            topo.create_egress(id, &req)
        })
        .await
    }

    pub async fn delete_egress(&self, network: &str, node_id: &str) -> ControlResult<Node> {
        self.with_topology(network, node_id, "Deleted egress gateway", |topo, id| {
            topo.delete_egress(id)
        })
        .await
    }

    pub async fn create_ingress(&self, network: &str, node_id: &str) -> ControlResult<Node> {
        self.with_topology(network, node_id, "Created ingress gateway", |topo, id| {
            topo.create_ingress(id)
        })
        .await
    }

    pub async fn delete_ingress(&self, network: &str, node_id: &str) -> ControlResult<Node> {
        self.with_topology(network, node_id, "Deleted ingress gateway", |topo, id| {
            topo.delete_ingress(id)
        })
        .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get(&self, network: &str, node_id: &str) -> ControlResult<NodeGet> {
        let network_name = network.to_string();
        let nodes = execute_async(&self.db, move |conn| {
            node_registry::list_network_nodes(conn, &network_name)
        })
        .await?;

        let node = nodes
            .iter()
            .find(|n| n.id == node_id)
            .cloned()
            .ok_or_else(|| node_not_found(node_id))?;
        let peers = compute_peers(&node, &nodes);

        Ok(NodeGet {
            node,
            peers,
            server_config: self.propagator.server_info().clone(),
        })
    }

    pub async fn list_all(&self, ctx: &RequestContext) -> ControlResult<Vec<Node>> {
        let nodes = execute_async(&self.db, node_registry::list_nodes).await?;
        if ctx.is_admin() {
            return Ok(nodes);
        }
        let networks: &[String] = match &ctx.identity {
            Identity::User { networks, .. } => networks,
            _ => &[],
        };
        Ok(nodes
            .into_iter()
            .filter(|n| networks.contains(&n.network))
            .collect())
    }

    pub async fn list_network(&self, network: &str) -> ControlResult<Vec<Node>> {
        let network_name = network.to_string();
        let nodes = execute_async(&self.db, move |conn| {
            node_registry::list_network_nodes(conn, &network_name)
        })
        .await?;
        Ok(nodes)
    }

    pub async fn last_modified(&self, network: &str) -> ControlResult<i64> {
        let network_name = network.to_string();
        let found = execute_async(&self.db, move |conn| {
            network_registry::find_network(conn, &network_name)
        })
        .await?;
        found
            .map(|n| n.nodes_last_modified)
            .ok_or_else(|| ControlError::NotFound(format!("network {} does not exist", network)))
    }

    // ========================================================================
    // Bootstrap logins
    // ========================================================================

    pub async fn authenticate_node(&self, network: &str, params: AuthParams) -> ControlResult<LoginResponse> {
        if params.id.is_empty() {
            return Err(ControlError::InvalidInput("node id is required".into()));
        }
        if params.password.is_empty() {
            return Err(ControlError::InvalidInput("password is required".into()));
        }

        let id = params.id.clone();
        let node = execute_async(&self.db, move |conn| node_registry::find_node(conn, &id))
            .await?
            .filter(|n| n.network == network)
            .ok_or_else(|| node_not_found(&params.id))?;

        let hasher = self.hasher.clone();
        let hash = node.password_hash.clone();
        let password = params.password.clone();
        let valid = tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .context("Task join error")?;
        if !valid {
            warn!("Failed login for node {} in network {}", node.id, network);
            return Err(ControlError::Unauthenticated("incorrect credentials".into()));
        }

        let mac = params
            .macaddress
            .or(node.mac_address.clone())
            .unwrap_or_default();
        let auth_token = self.signer.issue_node_token(&node.id, &mac, &node.network)?;
        info!("Node {} authenticated in network {}", node.id, network);

        Ok(LoginResponse {
            auth_token,
            id: node.id,
        })
    }

    pub async fn authenticate_user(&self, params: UserAuthParams) -> ControlResult<LoginResponse> {
        if params.username.is_empty() || params.password.is_empty() {
            return Err(ControlError::InvalidInput(
                "username and password are required".into(),
            ));
        }

        let username = params.username.clone();
        let user = execute_async(&self.db, move |conn| user_registry::find_user(conn, &username))
            .await?
            .ok_or_else(|| ControlError::Unauthenticated("incorrect credentials".into()))?;

        let hasher = self.hasher.clone();
        let hash = user.password_hash.clone();
        let password = params.password;
        let valid = tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .context("Task join error")?;
        if !valid {
            warn!("Failed login for user {}", user.username);
            return Err(ControlError::Unauthenticated("incorrect credentials".into()));
        }

        let auth_token = self.signer.issue_user_token(&user)?;
        info!("User {} authenticated", user.username);
        Ok(LoginResponse {
            auth_token,
            id: user.username,
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::db::testing::temp_pool;
    use crate::services::bus::testing::{RecordingBus, RecordingDns};
    use crate::services::credentials::{testing as creds, Argon2Hasher};
    use crate::services::propagation::PropagationSettings;
    use crate::types::{AccessKey, ServerInfo};
    use std::time::Duration;
    use tempfile::TempDir;

    pub const ACCESS_KEY: &str = "join-secret";

    pub struct Harness {
        pub lifecycle: Arc<NodeLifecycle>,
        pub bus: Arc<RecordingBus>,
        pub dns: Arc<RecordingDns>,
        pub db: DbPool,
        pub signer: Arc<dyn TokenSigner>,
        _dir: TempDir,
    }

    impl Harness {
        pub fn new(settings: LifecycleSettings) -> Self {
            Self::build(settings, false)
        }

        /// A harness whose propagator runs as the network's own server.
        pub fn client_mode() -> Self {
            Self::build(Self::standard_settings(), true)
        }

        fn build(settings: LifecycleSettings, client_mode: bool) -> Self {
            let (db, dir) = temp_pool();
            {
                let conn = db.get().unwrap();
                let mut open = network_registry::fixtures::network("n1");
                open.allow_manual_signup = true;
                network_registry::insert_network(&conn, &open).unwrap();
                network_registry::insert_network(&conn, &network_registry::fixtures::network("n2"))
                    .unwrap();
                for net in ["n1", "n2"] {
                    network_registry::insert_access_key(
                        &conn,
                        net,
                        &AccessKey {
                            name: "default".into(),
                            value: ACCESS_KEY.into(),
                            uses: 100,
                        },
                    )
                    .unwrap();
                }
            }

            let bus = Arc::new(RecordingBus::default());
            let dns = Arc::new(RecordingDns::default());
            let signer = creds::signer();
            let propagator = Propagator::new(
                db.clone(),
                bus.clone(),
                ServerInfo {
                    name: "srv".into(),
                    ..Default::default()
                },
                PropagationSettings {
                    concurrency: 4,
                    queue_limit: 256,
                    timeout: Duration::from_secs(2),
                    client_mode,
                    server_name: "srv".into(),
                },
            );
            let lifecycle = Arc::new(NodeLifecycle::new(
                db.clone(),
                Arc::new(Argon2Hasher),
                signer.clone(),
                propagator,
                dns.clone(),
                settings,
            ));

            Self {
                lifecycle,
                bus,
                dns,
                db,
                signer,
                _dir: dir,
            }
        }

        pub fn standard() -> Self {
            Self::new(Self::standard_settings())
        }

        fn standard_settings() -> LifecycleSettings {
            LifecycleSettings {
                allow_remote_exec: false,
                dns_mode: false,
                server_traffic_key: Some("server-traffic-key".into()),
            }
        }

        pub fn draft(name: &str) -> NodeDraft {
            NodeDraft {
                name: Some(name.to_string()),
                public_key: format!("pk-{}", name),
                password: Some("node-password".into()),
                traffic_keys: TrafficKeys {
                    mine: Some(format!("traffic-{}", name)),
                    server: None,
                },
                access_key: Some(ACCESS_KEY.into()),
                ..Default::default()
            }
        }

        pub async fn register(&self, network: &str, name: &str) -> Node {
            self.lifecycle
                .register(network, None, Self::draft(name))
                .await
                .unwrap()
                .node
        }

        pub async fn settle(&self) {
            self.lifecycle.propagator().wait_idle().await;
            self.bus.clear();
        }
    }
}
