//! Detached fan-out of peer updates and server reloads.
//!
//! Every committed mutation hands the affected nodes to the [`Propagator`].
//! Jobs run on a [`TaskTracker`] behind a semaphore; the request path never
//! waits on them. Bus failures and timeouts are logged and dropped.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::config::ServerSettings;
use crate::db::{execute_async, DbPool};
use crate::services::bus::MessageBus;
use crate::services::node_registry;
use crate::services::peers::{compute_peers, find_leader, find_local_server};
use crate::types::{Node, NodeAction, PeerUpdate, ServerInfo, ServerReload};

#[derive(Debug, Clone)]
pub struct PropagationSettings {
    pub concurrency: usize,
    pub queue_limit: usize,
    pub timeout: Duration,
    pub client_mode: bool,
    pub server_name: String,
}

impl From<&ServerSettings> for PropagationSettings {
    fn from(s: &ServerSettings) -> Self {
        Self {
            concurrency: s.propagation_concurrency.max(1),
            queue_limit: s.propagation_queue_limit.max(1),
            timeout: Duration::from_secs(s.propagation_timeout_secs.max(1)),
            client_mode: s.client_mode,
            server_name: s.name.clone(),
        }
    }
}

/// Build the peer update addressed to `node`.
///
/// A node marked for deletion gets an empty peer list so it tears down.
pub fn peer_update(node: &Node, network_nodes: &[Node], server: &ServerInfo) -> PeerUpdate {
    let peers = match node.action {
        NodeAction::Delete => Vec::new(),
        NodeAction::None => compute_peers(node, network_nodes),
    };
    PeerUpdate {
        node_id: node.id.clone(),
        network: node.network.clone(),
        action: node.action,
        peers,
        server: server.clone(),
    }
}

#[derive(Clone)]
pub struct Propagator {
    inner: Arc<Inner>,
}

struct Inner {
    db: DbPool,
    bus: Arc<dyn MessageBus>,
    server: ServerInfo,
    settings: PropagationSettings,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl Propagator {
    pub fn new(
        db: DbPool,
        bus: Arc<dyn MessageBus>,
        server: ServerInfo,
        settings: PropagationSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrency));
        Self {
            inner: Arc::new(Inner {
                db,
                bus,
                server,
                settings,
                tracker: TaskTracker::new(),
                permits,
            }),
        }
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.inner.server
    }

    /// Number of jobs queued or running.
    pub fn outstanding(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Notify `node`; in client mode a server node also refreshes this
    /// control plane's own server record.
    pub fn propagate(&self, node: Node, interface_changed: bool) {
        let inner = self.inner.clone();
        self.spawn("propagate", async move {
            inner.run_propagate(node, interface_changed).await;
        });
    }

    /// Notify `node` and always reload the network leader.
    pub fn force_propagate(&self, node: Node) {
        let inner = self.inner.clone();
        self.spawn("force_propagate", async move {
            inner.run_force_propagate(node).await;
        });
    }

    fn spawn<F>(&self, what: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.tracker.len() >= self.inner.settings.queue_limit {
            warn!(
                "Propagation queue full ({} jobs), dropping {} job",
                self.inner.tracker.len(),
                what
            );
            return;
        }

        let permits = self.inner.permits.clone();
        self.inner.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });
    }

    /// Wait until every job spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Give outstanding jobs up to `grace` to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "Propagation shutdown timed out with {} jobs outstanding",
                self.inner.tracker.len()
            );
        }
    }
}

impl Inner {
    async fn network_nodes(&self, network: &str) -> Result<Vec<Node>> {
        let network = network.to_string();
        execute_async(&self.db, move |conn| {
            node_registry::list_network_nodes(conn, &network)
        })
        .await
    }

    async fn deliver<F>(&self, what: String, call: F)
    where
        F: Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(Ok(())) => debug!("Delivered {}", what),
            Ok(Err(e)) => warn!("Failed to deliver {}: {:#}", what, e),
            Err(_) => warn!(
                "Timed out delivering {} after {:?}",
                what, self.settings.timeout
            ),
        }
    }

    async fn send_peer_update(&self, node: &Node, nodes: &[Node]) {
        let update = peer_update(node, nodes, &self.server);
        self.deliver(
            format!("peer update for {}", node.id),
            self.bus.publish_peer_update(&update),
        )
        .await;
    }

    async fn send_reload(&self, server: &Node, interface_changed: bool) {
        let reload = ServerReload {
            server_node_id: server.id.clone(),
            network: server.network.clone(),
            interface_changed,
        };
        self.deliver(
            format!("server reload for {}", server.id),
            self.bus.publish_server_reload(&reload),
        )
        .await;
    }

    async fn run_propagate(&self, node: Node, interface_changed: bool) {
        let nodes = match self.network_nodes(&node.network).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("Propagation for {} could not load network {}: {:#}", node.id, node.network, e);
                return;
            }
        };

        self.send_peer_update(&node, &nodes).await;

        if !(self.settings.client_mode && node.is_server) {
            return;
        }

        let Some(local) = find_local_server(&nodes, &self.settings.server_name) else {
            warn!("No local server record in network {}", node.network);
            return;
        };

        let is_leader = find_leader(&nodes).is_some_and(|leader| leader.id == local.id);
        if interface_changed && is_leader {
            for peer in nodes.iter().filter(|n| !n.is_pending) {
                self.send_peer_update(peer, &nodes).await;
            }
        }
        self.send_reload(local, interface_changed).await;
    }

    async fn run_force_propagate(&self, node: Node) {
        let nodes = match self.network_nodes(&node.network).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("Propagation for {} could not load network {}: {:#}", node.id, node.network, e);
                return;
            }
        };

        self.send_peer_update(&node, &nodes).await;

        match find_leader(&nodes) {
            Some(leader) => self.send_reload(leader, true).await,
            None => debug!("Network {} has no leader to reload", node.network),
        }
    }
}
