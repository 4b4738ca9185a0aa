use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted `netmeshctl` settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub base_url: Option<String>,
    /// User token stored by `login`.
    pub token: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path).with_context(|| format!("Failed to read config {:?}", path))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir {:?}", parent))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("Failed to serialize config")?;
        fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("netmeshctl");
    dir.push("config.json");
    dir
}

/// Pick the credential to send: explicit flag, then master key, then stored login.
pub fn resolve_token(
    flag: Option<String>,
    master_key: Option<String>,
    cfg: &Config,
) -> Option<String> {
    flag.filter(|t| !t.is_empty())
        .or_else(|| master_key.filter(|k| !k.is_empty()))
        .or_else(|| cfg.token.clone())
}
