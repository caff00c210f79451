//! rustls client configuration for outbound (m)TLS connections.

use std::path::Path;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use super::certificate::{ClientCertificate, load_certs};
use super::crypto_provider;
use crate::{Error, Result};

/// Trust anchors used to verify destination servers.
///
/// Configs are built per connection so that a renewed client certificate
/// takes effect on the next dial without rebuilding the proxy.
#[derive(Debug, Clone)]
pub struct TlsClientSettings {
    roots: Arc<RootCertStore>,
}

impl Default for TlsClientSettings {
    fn default() -> Self {
        Self::with_webpki_roots()
    }
}

impl TlsClientSettings {
    /// Trust the Mozilla root program.
    #[must_use]
    pub fn with_webpki_roots() -> Self {
        Self::with_roots(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        })
    }

    /// Trust exactly `roots`.
    #[must_use]
    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
        }
    }

    /// Add every certificate in a PEM file as a trust anchor.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a certificate is not
    /// a usable trust anchor.
    pub fn add_pem_file(&mut self, path: &Path) -> Result<usize> {
        let certs = load_certs(path)?;
        let roots = Arc::make_mut(&mut self.roots);
        for cert in &certs {
            roots.add(cert.clone()).map_err(|e| {
                Error::Tls(format!(
                    "Failed to add CA cert from '{}' to trust store: {e}",
                    path.display()
                ))
            })?;
        }
        debug!(path = %path.display(), count = certs.len(), "Added trust anchors");
        Ok(certs.len())
    }

    /// Number of trust anchors.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Build a client config, presenting `cert` when given.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if the key does not match the certificate or the
    /// protocol configuration is rejected.
    pub fn client_config(&self, cert: Option<&ClientCertificate>) -> Result<Arc<ClientConfig>> {
        let builder = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
            .with_root_certificates(Arc::clone(&self.roots));

        let config = match cert {
            Some(cert) => builder
                .with_client_auth_cert(cert.chain().to_vec(), cert.key())
                .map_err(|e| Error::Tls(format!("Client certificate rejected: {e}")))?,
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use rustls::client::ResolvesClientCert;

    use super::*;
    use crate::test_support::{TestCa, far_future};

    #[test]
    fn webpki_roots_are_loaded_by_default() {
        assert!(TlsClientSettings::default().root_count() > 50);
    }

    #[test]
    fn add_pem_file_extends_roots() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCa::new();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, &ca.cert_pem).unwrap();

        let mut settings = TlsClientSettings::with_roots(RootCertStore::empty());
        assert_eq!(settings.add_pem_file(&path).unwrap(), 1);
        assert_eq!(settings.root_count(), 1);
    }

    #[test]
    fn client_config_with_and_without_certificate() {
        let ca = TestCa::new();
        let settings = TlsClientSettings::with_roots(ca.roots());

        let anonymous = settings.client_config(None).unwrap();
        assert!(!anonymous.client_auth_cert_resolver.has_certs());

        let cert = ca.issue_client("agent", 1, far_future()).client_certificate();
        let mutual = settings.client_config(Some(&cert)).unwrap();
        assert!(mutual.client_auth_cert_resolver.has_certs());
    }
}
