//! Credential verification: bearer tokens, node passwords and the operator
//! master key.
//!
//! A verified credential yields exactly one [`Identity`]. Token signing and
//! password hashing sit behind [`TokenSigner`] and [`SecretHasher`] so the
//! gate and lifecycle code never touch the primitives directly.

use anyhow::{Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use ipnet::IpNet;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ControlError;
use crate::types::User;

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Node {
        node_id: String,
        network: String,
    },
    User {
        username: String,
        networks: Vec<String>,
        is_admin: bool,
    },
    /// Operator holding the out-of-band master key.
    Master,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeClaims {
    pub sub: String,
    pub kind: String,
    pub mac: String,
    pub network: String,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: String,
    pub kind: String,
    pub networks: Vec<String>,
    pub admin: bool,
    pub iat: u64,
    pub exp: u64,
}

const NODE_KIND: &str = "node";
const USER_KIND: &str = "user";

/// Issues and verifies signed bearer tokens.
pub trait TokenSigner: Send + Sync {
    fn issue_node_token(&self, node_id: &str, mac: &str, network: &str) -> Result<String>;
    fn verify_node_token(&self, token: &str) -> Result<NodeClaims>;
    fn issue_user_token(&self, user: &User) -> Result<String>;
    fn verify_user_token(&self, token: &str) -> Result<UserClaims>;
}

/// One-way comparison of secrets against stored hashes.
pub trait SecretHasher: Send + Sync {
    fn hash(&self, secret: &str) -> Result<String>;
    fn verify(&self, secret: &str, hash: &str) -> bool;
}

// ============================================================================
// HS256 tokens
// ============================================================================

pub struct JwtSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl JwtSigner {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self> {
        if secret.is_empty() {
            anyhow::bail!("token secret must not be empty");
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        })
    }

    fn window(&self) -> (u64, u64) {
        let now = time::OffsetDateTime::now_utc().unix_timestamp().max(0) as u64;
        (now, now + self.ttl.as_secs())
    }

    fn validation() -> Validation {
        Validation::new(Algorithm::HS256)
    }
}

impl TokenSigner for JwtSigner {
    fn issue_node_token(&self, node_id: &str, mac: &str, network: &str) -> Result<String> {
        let (iat, exp) = self.window();
        let claims = NodeClaims {
            sub: node_id.to_string(),
            kind: NODE_KIND.to_string(),
            mac: mac.to_string(),
            network: network.to_string(),
            iat,
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .context("Failed to sign node token")
    }

    fn verify_node_token(&self, token: &str) -> Result<NodeClaims> {
        let data = decode::<NodeClaims>(token, &self.decoding, &Self::validation())
            .context("Invalid node token")?;
        if data.claims.kind != NODE_KIND {
            anyhow::bail!("Token is not a node token");
        }
        Ok(data.claims)
    }

    fn issue_user_token(&self, user: &User) -> Result<String> {
        let (iat, exp) = self.window();
        let claims = UserClaims {
            sub: user.username.clone(),
            kind: USER_KIND.to_string(),
            networks: user.networks.clone(),
            admin: user.is_admin,
            iat,
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .context("Failed to sign user token")
    }

    fn verify_user_token(&self, token: &str) -> Result<UserClaims> {
        let data = decode::<UserClaims>(token, &self.decoding, &Self::validation())
            .context("Invalid user token")?;
        if data.claims.kind != USER_KIND {
            anyhow::bail!("Token is not a user token");
        }
        Ok(data.claims)
    }
}

// ============================================================================
// Argon2 password hashing
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct Argon2Hasher;

#[inline]
fn argon2_instance() -> Argon2<'static> {
    #[cfg(test)]
    {
        // Minimal cost so unit tests stay fast.
        let params = argon2::Params::new(1024, 1, 1, None).expect("valid Argon2 params for tests");
        Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
    }

    #[cfg(not(test))]
    {
        Argon2::default()
    }
}

impl SecretHasher for Argon2Hasher {
    fn hash(&self, secret: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        argon2_instance()
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| anyhow::anyhow!("Failed to hash secret: {}", e))
    }

    fn verify(&self, secret: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => argon2_instance()
                .verify_password(secret.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }
}

// ============================================================================
// Master key
// ============================================================================

/// Operator escape hatch. Only the SHA-256 digest of the key is kept.
pub struct MasterKey {
    digest: [u8; 32],
    sources: Vec<IpNet>,
}

impl MasterKey {
    pub fn new(key: &str, sources: Vec<IpNet>) -> Result<Self> {
        if key.len() < 16 {
            anyhow::bail!("master key must be at least 16 characters");
        }
        Ok(Self {
            digest: Sha256::digest(key.as_bytes()).into(),
            sources,
        })
    }

    fn digest_matches(&self, presented: &str) -> bool {
        let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        presented
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    fn source_allowed(&self, source: Option<IpAddr>) -> bool {
        if self.sources.is_empty() {
            return true;
        }
        match source {
            Some(ip) => self.sources.iter().any(|net| net.contains(&ip)),
            None => false,
        }
    }
}

// ============================================================================
// Verifier
// ============================================================================

pub struct CredentialVerifier {
    signer: Arc<dyn TokenSigner>,
    master: Option<MasterKey>,
}

impl CredentialVerifier {
    pub fn new(signer: Arc<dyn TokenSigner>, master: Option<MasterKey>) -> Self {
        Self { signer, master }
    }

    pub fn signer(&self) -> &Arc<dyn TokenSigner> {
        &self.signer
    }

    /// Resolve a bearer credential to an identity.
    ///
    /// Node tokens are only considered when `nodes_allowed`. Failure is always
    /// `Unauthenticated`; scope checks happen in the authorization gate.
    pub fn verify(
        &self,
        token: &str,
        nodes_allowed: bool,
        source: Option<IpAddr>,
    ) -> Result<Identity, ControlError> {
        if let Some(master) = &self.master {
            if master.digest_matches(token) {
                if master.source_allowed(source) {
                    info!(
                        "Master key accepted from {}",
                        source.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into())
                    );
                    return Ok(Identity::Master);
                }
                warn!(
                    "Master key presented from disallowed source {}",
                    source.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into())
                );
                return Err(ControlError::Unauthenticated(
                    "master key not accepted from this source".into(),
                ));
            }
        }

        if nodes_allowed {
            if let Ok(claims) = self.signer.verify_node_token(token) {
                return Ok(Identity::Node {
                    node_id: claims.sub,
                    network: claims.network,
                });
            }
        }

        match self.signer.verify_user_token(token) {
            Ok(claims) => Ok(Identity::User {
                username: claims.sub,
                networks: claims.networks,
                is_admin: claims.admin,
            }),
            Err(_) => Err(ControlError::Unauthenticated("invalid token".into())),
        }
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?;
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next()?;
    let token = parts.next()?.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token)
}
