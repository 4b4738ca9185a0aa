//! Route-scoped authorization decisions.
//!
//! Every protected route declares a [`RoutePolicy`]; [`AuthorizationGate`]
//! turns a bearer credential plus the path parameters into a
//! [`RequestContext`] or a rejection. The scope table lives in
//! [`scope_allows`].

use std::net::IpAddr;
use std::sync::Arc;

use crate::db::{execute_async, DbPool};
use crate::error::{ControlError, ControlResult};
use crate::services::credentials::{CredentialVerifier, Identity};
use crate::services::{network_registry, node_registry};

pub const UNKNOWN_USER: &str = "(unknown)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Any verified identity.
    All,
    /// Any node identity, or a network admin.
    Nodes,
    /// A network admin, or a node of the path network.
    Network,
    /// A network admin, or the node named in the path.
    Node,
    /// Any verified identity.
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePolicy {
    pub nodes_allowed: bool,
    pub network_check: bool,
    pub scope: Scope,
}

impl RoutePolicy {
    pub const fn new(nodes_allowed: bool, network_check: bool, scope: Scope) -> Self {
        Self {
            nodes_allowed,
            network_check,
            scope,
        }
    }
}

/// Resolved caller, attached to the request once the gate lets it through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub identity: Identity,
    pub username: String,
    pub master: bool,
}

impl RequestContext {
    pub fn new(identity: Identity) -> Self {
        let username = match &identity {
            Identity::User { username, .. } if !username.is_empty() => username.clone(),
            _ => UNKNOWN_USER.to_string(),
        };
        let master = identity == Identity::Master;
        Self {
            identity,
            username,
            master,
        }
    }

    /// Master or a global admin user.
    pub fn is_admin(&self) -> bool {
        match &self.identity {
            Identity::Master => true,
            Identity::User { is_admin, .. } => *is_admin,
            Identity::Node { .. } => false,
        }
    }

    /// Whether this caller may administer `network`.
    pub fn can_manage(&self, network: &str) -> bool {
        match &self.identity {
            Identity::Master => true,
            Identity::User {
                is_admin, networks, ..
            } => *is_admin || networks.iter().any(|n| n == network),
            Identity::Node { .. } => false,
        }
    }
}

/// The network a node identity belongs to, looked up from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeLookup {
    NotNeeded,
    Found(String),
    Missing,
}

/// Decision table for a non-master identity.
pub fn scope_allows(
    scope: Scope,
    identity: &Identity,
    is_network_admin: bool,
    path_network: Option<&str>,
    path_node: Option<&str>,
    lookup: &NodeLookup,
) -> bool {
    let node_in_path_network = || match (lookup, path_network) {
        (NodeLookup::Found(net), Some(path)) => net == path,
        _ => false,
    };

    match scope {
        Scope::All | Scope::User => true,
        Scope::Nodes => is_network_admin || matches!(identity, Identity::Node { .. }),
        Scope::Network => {
            is_network_admin
                || (matches!(identity, Identity::Node { .. }) && node_in_path_network())
        }
        Scope::Node => {
            if is_network_admin {
                return true;
            }
            match identity {
                Identity::Node { node_id, .. } => {
                    Some(node_id.as_str()) == path_node && node_in_path_network()
                }
                _ => false,
            }
        }
    }
}

pub struct AuthorizationGate {
    db: DbPool,
    verifier: Arc<CredentialVerifier>,
}

impl AuthorizationGate {
    pub fn new(db: DbPool, verifier: Arc<CredentialVerifier>) -> Self {
        Self { db, verifier }
    }

    pub async fn authorize(
        &self,
        policy: RoutePolicy,
        token: Option<&str>,
        path_network: Option<&str>,
        path_node: Option<&str>,
        source: Option<IpAddr>,
    ) -> ControlResult<RequestContext> {
        if policy.network_check {
            let exists = match path_network {
                Some(network) => {
                    let network = network.to_string();
                    execute_async(&self.db, move |conn| {
                        network_registry::network_exists(conn, &network)
                    })
                    .await?
                }
                None => false,
            };
            if !exists {
                return Err(ControlError::NotFound("this network does not exist".into()));
            }
        }

        let token = token.ok_or_else(|| ControlError::Unauthenticated("missing auth token".into()))?;
        let identity = self.verifier.verify(token, policy.nodes_allowed, source)?;

        if identity == Identity::Master {
            return Ok(RequestContext::new(identity));
        }

        let is_network_admin = match (&identity, path_network) {
            (Identity::User { is_admin: true, .. }, _) => true,
            (Identity::User { networks, .. }, Some(net)) => networks.iter().any(|n| n == net),
            _ => false,
        };

        let lookup = match (&identity, policy.scope) {
            (Identity::Node { node_id, .. }, Scope::Network | Scope::Node) if !is_network_admin => {
                let node_id = node_id.clone();
                let found = execute_async(&self.db, move |conn| {
                    node_registry::find_node(conn, &node_id)
                })
                .await?;
                match found {
                    Some(node) => NodeLookup::Found(node.network),
                    None => NodeLookup::Missing,
                }
            }
            _ => NodeLookup::NotNeeded,
        };

        if !scope_allows(
            policy.scope,
            &identity,
            is_network_admin,
            path_network,
            path_node,
            &lookup,
        ) {
            return Err(ControlError::Unauthorized(
                "you are unauthorized to access this endpoint".into(),
            ));
        }

        Ok(RequestContext::new(identity))
    }
}
