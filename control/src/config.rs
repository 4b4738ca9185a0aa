use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Control plane configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub server: ServerSettings,
    pub networks: Vec<NetworkSeed>,
    pub users: Vec<UserSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Name this server uses for its own node record in each network.
    pub name: String,
    pub master_key: Option<String>,
    /// Source networks allowed to present the master key. Empty means any.
    pub master_key_sources: Vec<IpNet>,
    pub token_secret: String,
    pub token_ttl_secs: u64,
    /// Allow node updates to overwrite pre-up/pre-down scripts.
    pub allow_remote_exec: bool,
    pub client_mode: bool,
    pub dns_mode: bool,
    pub traffic_public_key: Option<String>,
    pub api_endpoint: Option<String>,
    pub broker_url: Option<String>,
    /// Bearer token presented to the broker.
    pub broker_token: Option<String>,
    pub propagation_concurrency: usize,
    pub propagation_queue_limit: usize,
    pub propagation_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "netmesh-server".to_string(),
            master_key: None,
            master_key_sources: Vec::new(),
            token_secret: String::new(),
            token_ttl_secs: 24 * 60 * 60,
            allow_remote_exec: false,
            client_mode: false,
            dns_mode: false,
            traffic_public_key: None,
            api_endpoint: None,
            broker_url: None,
            broker_token: None,
            propagation_concurrency: 8,
            propagation_queue_limit: 1024,
            propagation_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSeed {
    pub name: String,
    pub address_range: Option<Ipv4Net>,
    pub address_range6: Option<Ipv6Net>,
    #[serde(default)]
    pub allow_manual_signup: bool,
    pub default_listen_port: Option<u16>,
    #[serde(default)]
    pub access_keys: Vec<AccessKeySeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessKeySeed {
    pub name: String,
    pub value: String,
    #[serde(default = "default_key_uses")]
    pub uses: i64,
}

fn default_key_uses() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    pub username: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub networks: Vec<String>,
}

impl ControlConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Self::parse(&text).with_context(|| format!("Failed to parse {:?}", path))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let cfg: ControlConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.server.name.trim().is_empty() {
            anyhow::bail!("server.name must not be empty");
        }
        if self.server.propagation_concurrency == 0 {
            anyhow::bail!("server.propagation_concurrency must be at least 1");
        }
        for net in &self.networks {
            if net.name.trim().is_empty() {
                anyhow::bail!("network name must not be empty");
            }
        }
        Ok(())
    }
}
