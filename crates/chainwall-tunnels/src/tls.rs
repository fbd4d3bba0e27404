//! TLS configuration loading.

use std::sync::Arc;

use chainwall_config::TlsServerSettings;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::error::TunnelError;

/// Build a server configuration from node settings.
///
/// ALPN is left empty; the TLS tunnel picks a protocol per connection.
pub fn load_tls_config(settings: &TlsServerSettings) -> Result<rustls::ServerConfig, TunnelError> {
    let certs = load_certs(&settings.cert_file)?;
    if certs.is_empty() {
        return Err(TunnelError::Config(format!(
            "no certificate found in {}",
            settings.cert_file
        )));
    }
    let key = load_private_key(&settings.key_file)?;

    // Use static slices to avoid heap allocation
    let versions: &[&'static rustls::SupportedProtocolVersion] =
        match (settings.min_version.as_str(), settings.max_version.as_str()) {
            ("tls13", "tls13") => &[&rustls::version::TLS13],
            ("tls12", "tls12") => &[&rustls::version::TLS12],
            ("tls12", "tls13") => &[&rustls::version::TLS12, &rustls::version::TLS13],
            (min, max) => {
                return Err(TunnelError::Config(format!(
                    "unsupported TLS version range {min}..{max}"
                )));
            }
        };

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(|e| TunnelError::Config(format!("TLS version error: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    info!(
        cert = %settings.cert_file,
        min_version = %settings.min_version,
        max_version = %settings.max_version,
        alpn = ?settings.alpn,
        "TLS configured"
    );

    Ok(config)
}

/// Load certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .map(|c| c.map(|v| v.into_owned()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Config(format!("invalid certificate in {path}: {e}")))
}

/// Load private key from a PEM file.
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue,
            None => break,
        }
    }
    Err(TunnelError::Config(format!("no private key found in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_certificate_block_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        std::fs::write(
            &path,
            "-----BEGIN CERTIFICATE-----\n!!not base64!!\n-----END CERTIFICATE-----\n",
        )
        .unwrap();

        let err = load_certs(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, TunnelError::Config(ref m) if m.contains("invalid certificate")));
    }

    #[test]
    fn missing_certificate_file_is_an_io_error() {
        let err = load_certs("/nonexistent/chainwall/cert.pem").unwrap_err();
        assert!(matches!(err, TunnelError::Io(_)));
    }
}
