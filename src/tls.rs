//! TLS configuration: server acceptor config for LDAPS/StartTLS and client
//! connector config for outgoing LDAPS/StartTLS.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Build a rustls ServerConfig from PEM certificate and key file paths.
/// With a CA file, client certificates signed by it are requested (but not required)
/// so that SASL EXTERNAL can identify the peer.
pub fn load_server_config_from_files(
    cert_file: &str,
    key_file: &str,
    ca_file: Option<&str>,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs_from_file(cert_file)?;
    let key = load_private_key_from_file(key_file)?;
    let builder = rustls::ServerConfig::builder();
    let builder = match ca_file {
        Some(ca) => {
            let roots = root_store_from_file(ca)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .context("Build client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let config = builder
        .with_single_cert(certs, key)
        .context("Build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

/// Client-side TLS settings.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptions {
    /// Extra trusted CA bundle, added to the system roots.
    pub ca_file: Option<String>,
    /// Client certificate and key presented for SASL EXTERNAL.
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Accept any server certificate. Test use only.
    pub skip_verify: bool,
}

/// Build a rustls ClientConfig with system roots plus the optional CA file.
pub fn load_client_config(options: &ClientTlsOptions) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
        let _ = root_store.add(cert);
    }
    if let Some(ca) = &options.ca_file {
        for cert in load_certs_from_file(ca)? {
            root_store.add(cert).context("Add CA certificate")?;
        }
    }
    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let mut config = match (&options.cert_file, &options.key_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs_from_file(cert)?, load_private_key_from_file(key)?)
            .context("Build ClientConfig with client certificate")?,
        (None, None) => builder.with_no_client_auth(),
        _ => anyhow::bail!("Client certificate and key must be configured together"),
    };
    if options.skip_verify {
        config.dangerous().set_certificate_verifier(Arc::new(InsecureServerVerifier));
    }
    Ok(Arc::new(config))
}

/// Resolve the TLS server name used for SNI and certificate checks.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|_| anyhow::anyhow!("Invalid hostname for TLS SNI: {}", host))
}

fn root_store_from_file(path: &str) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs_from_file(path)? {
        roots.add(cert).context("Add CA certificate")?;
    }
    Ok(roots)
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("Open key file: {}", path))?;
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let rsa: Vec<_> = rsa_private_keys(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

/// Check that cert and key files exist and load (for startup validation).
pub fn validate_tls_files(cert_file: &str, key_file: &str, ca_file: Option<&str>) -> Result<()> {
    if !Path::new(cert_file).exists() {
        anyhow::bail!("TLS cert file not found: {}", cert_file);
    }
    if !Path::new(key_file).exists() {
        anyhow::bail!("TLS key file not found: {}", key_file);
    }
    if let Some(ca) = ca_file {
        if !Path::new(ca).exists() {
            anyhow::bail!("TLS CA file not found: {}", ca);
        }
    }
    load_server_config_from_files(cert_file, key_file, ca_file)?;
    Ok(())
}

/// Accepts any server certificate. Only for `skip_verify`.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_missing_files() {
        let err = validate_tls_files("/nonexistent/cert.pem", "/nonexistent/key.pem", None).unwrap_err();
        assert!(err.to_string().contains("cert file not found"));
    }

    #[test]
    fn test_client_config_requires_cert_and_key_together() {
        let options = ClientTlsOptions {
            cert_file: Some("/nonexistent/cert.pem".into()),
            ..Default::default()
        };
        assert!(load_client_config(&options).is_err());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("ldap.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("").is_err());
    }

    #[test]
    fn test_empty_cert_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();
        assert!(load_certs_from_file(&path).is_err());
    }
}
