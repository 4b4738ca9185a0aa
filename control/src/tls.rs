use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Build the listener TLS configuration.
///
/// With `client_ca` every client must present a certificate chaining to it.
pub fn listener_config(cert: &Path, key: &Path, client_ca: Option<&Path>) -> Result<RustlsConfig> {
    let server = server_config(cert, key, client_ca)?;
    Ok(RustlsConfig::from_config(Arc::new(server)))
}

fn server_config(cert: &Path, key: &Path, client_ca: Option<&Path>) -> Result<ServerConfig> {
    let chain = read_certs(cert)?;
    let key = read_key(key)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("TLS provider rejected default protocol versions")?;

    let config = match client_ca {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for cert in read_certs(ca)? {
                roots
                    .add(cert)
                    .with_context(|| format!("Bad client CA certificate in {:?}", ca))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .context("Failed to build client certificate verifier")?;

            info!("Client certificates required (CA {:?})", ca);
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)
                .context("Invalid server certificate or key")?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .context("Invalid server certificate or key")?,
    };

    Ok(config)
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates in {:?}", path);
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key in {:?}", path))?
        .with_context(|| format!("No private key in {:?}", path))
}
