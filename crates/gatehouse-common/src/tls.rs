//! TLS material for the client listener
//!
//! Supports both self-signed certificates (for development) and
//! PEM certificate/key files (for production).

use crate::config::TlsSettings;
use crate::error::{GatehouseError, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Server-side TLS configuration
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
    cert_chain: Vec<CertificateDer<'static>>,
}

impl TlsConfig {
    /// Create TLS config from certificate and key files
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        info!(cert = %cert_path.display(), "Loading TLS certificates from files");

        let cert_file = std::fs::File::open(cert_path)
            .map_err(|e| GatehouseError::TlsError(format!("Failed to open cert file: {}", e)))?;
        let key_file = std::fs::File::open(key_path)
            .map_err(|e| GatehouseError::TlsError(format!("Failed to open key file: {}", e)))?;

        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| GatehouseError::TlsError(format!("Failed to parse certificates: {}", e)))?;
        if certs.is_empty() {
            return Err(GatehouseError::TlsError(
                "No certificate found in cert file".into(),
            ));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| GatehouseError::TlsError(format!("Failed to parse private key: {}", e)))?
            .ok_or_else(|| GatehouseError::TlsError("No private key found in key file".into()))?;

        Self::from_certs_and_key(certs, key)
    }

    /// Create TLS config with a self-signed certificate
    pub fn self_signed(common_name: &str) -> Result<Self> {
        info!("Generating self-signed TLS certificate for: {}", common_name);

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "Gatehouse");
        params.distinguished_name = dn;

        params.subject_alt_names = vec![
            SanType::DnsName(common_name.try_into().map_err(tls_err)?),
            SanType::DnsName("localhost".try_into().map_err(tls_err)?),
            SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        ];

        let key_pair = KeyPair::generate().map_err(tls_err)?;
        let cert = params.self_signed(&key_pair).map_err(tls_err)?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| GatehouseError::TlsError(format!("Failed to serialize private key: {}", e)))?;

        Self::from_certs_and_key(vec![cert_der], key_der)
    }

    /// Build from settings: PEM files first, self-signed as the fallback
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        if let (Some(cert), Some(key)) = (&settings.cert_path, &settings.key_path) {
            match Self::from_files(Path::new(cert), Path::new(key)) {
                Ok(config) => return Ok(config),
                Err(e) if settings.self_signed => {
                    warn!("Failed to load TLS from files: {} - falling back to self-signed", e);
                }
                Err(e) => return Err(e),
            }
        }

        if settings.self_signed {
            return Self::self_signed(&settings.common_name);
        }

        Err(GatehouseError::ConfigError(
            "TLS requires tls.cert_path and tls.key_path or tls.self_signed=true".into(),
        ))
    }

    fn from_certs_and_key(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs.clone(), key)
            .map_err(|e| GatehouseError::TlsError(format!("TLS configuration error: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(server_config),
            cert_chain: certs,
        })
    }

    /// Get the TLS acceptor for async connections
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }

    /// Certificates presented to clients
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }
}

fn tls_err<E: std::fmt::Display>(e: E) -> GatehouseError {
    GatehouseError::TlsError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn install_provider() {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    }

    #[test]
    fn test_self_signed_cert() {
        install_provider();
        let config = TlsConfig::self_signed("test.gatehouse.local").unwrap();
        assert_eq!(config.cert_chain().len(), 1);
        let _acceptor = config.acceptor();
    }

    #[test]
    fn test_from_settings_requires_material() {
        install_provider();
        let settings = TlsSettings {
            self_signed: false,
            ..Default::default()
        };
        let err = TlsConfig::from_settings(&settings).err().unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_from_pem_files() {
        install_provider();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "localhost");
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(key_pair.serialize_pem().as_bytes()).unwrap();

        let config = TlsConfig::from_files(cert_file.path(), key_file.path()).unwrap();
        assert_eq!(config.cert_chain().len(), 1);
    }

    #[test]
    fn test_bad_files_fall_back_to_self_signed() {
        install_provider();
        let settings = TlsSettings {
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            self_signed: true,
            common_name: "fallback.local".into(),
        };
        assert!(TlsConfig::from_settings(&settings).is_ok());

        let strict = TlsSettings {
            self_signed: false,
            ..settings
        };
        let err = TlsConfig::from_settings(&strict).err().unwrap();
        assert_eq!(err.code(), "TLS_ERROR");
    }
}
