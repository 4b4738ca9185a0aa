//! Publish-only message bus and DNS hook collaborators.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{PeerUpdate, ServerReload};

/// Delivery is at-most-once: callers never retry a failed publish.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish_peer_update(&self, update: &PeerUpdate) -> Result<()>;
    async fn publish_server_reload(&self, reload: &ServerReload) -> Result<()>;
}

#[async_trait]
pub trait DnsHook: Send + Sync {
    async fn regenerate(&self, network: &str) -> Result<()>;
}

// ============================================================================
// HTTP broker
// ============================================================================

#[derive(Clone)]
pub struct HttpBus {
    base_url: Url,
    token: Option<Arc<str>>,
    client: reqwest::Client,
}

impl HttpBus {
    pub fn new(base_url: &str, token: Option<Arc<str>>, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context("Invalid broker_url")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build broker HTTP client")?;

        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Failed to join broker_url={} with path={}", self.base_url, path))
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        ensure_request_id(&mut headers);
        if let Some(token) = &self.token {
            let v = format!("Bearer {}", token);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&v).context("Invalid broker token value")?,
            );
        }
        Ok(headers)
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.url(path)?;
        debug!("Publishing to {}", url);

        let resp = self
            .client
            .post(url.clone())
            .headers(self.headers()?)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Broker request to {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("Broker rejected {} with status {}", url, status);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn publish_peer_update(&self, update: &PeerUpdate) -> Result<()> {
        self.post(&format!("peers/{}", update.node_id), update).await
    }

    async fn publish_server_reload(&self, reload: &ServerReload) -> Result<()> {
        self.post(&format!("servers/{}/reload", reload.server_node_id), reload)
            .await
    }
}

fn ensure_request_id(headers: &mut HeaderMap) {
    let name = HeaderName::from_static("x-request-id");
    if headers.contains_key(&name) {
        return;
    }

    match HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(e) => {
            warn!("Failed to set x-request-id header: {}", e);
        }
    }
}

// ============================================================================
// Log-only fallbacks
// ============================================================================

/// Used when no broker is configured.
#[derive(Debug, Default)]
pub struct LogBus;

#[async_trait]
impl MessageBus for LogBus {
    async fn publish_peer_update(&self, update: &PeerUpdate) -> Result<()> {
        info!(
            "Peer update for node {} in {} ({} peers, action={})",
            update.node_id,
            update.network,
            update.peers.len(),
            update.action.as_str()
        );
        Ok(())
    }

    async fn publish_server_reload(&self, reload: &ServerReload) -> Result<()> {
        info!(
            "Server reload for {} in {} (interface_changed={})",
            reload.server_node_id, reload.network, reload.interface_changed
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogDnsHook;

#[async_trait]
impl DnsHook for LogDnsHook {
    async fn regenerate(&self, network: &str) -> Result<()> {
        info!("DNS regeneration requested for network {}", network);
        Ok(())
    }
}
