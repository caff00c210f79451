//! Client certificate material: PEM loading and leaf inspection.
//!
//! # File format
//!
//! Certificates and keys are expected in **PEM format**. The chain file may
//! contain intermediates after the leaf; the key file must contain exactly
//! one private key (PKCS#8, PKCS#1 or SEC1).

use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Leaf metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Fields of the leaf certificate that drive renewal decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    /// End of the validity period.
    pub not_after: SystemTime,
    /// Raw serial number bytes.
    pub serial: Vec<u8>,
    /// Human-readable subject label for logs.
    pub subject: String,
}

impl LeafInfo {
    /// Parse a DER-encoded X.509 certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the bytes are not a certificate.
    pub fn parse(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("Failed to parse leaf certificate: {e}")))?;

        let timestamp = cert.validity().not_after.timestamp();
        let not_after = u64::try_from(timestamp)
            .map_or(UNIX_EPOCH, |secs| UNIX_EPOCH + Duration::from_secs(secs));

        Ok(Self {
            not_after,
            serial: cert.raw_serial().to_vec(),
            subject: extract_cn(&cert).unwrap_or_else(|| "<unknown>".to_owned()),
        })
    }

    /// Whether the certificate is still valid `margin` from now.
    #[must_use]
    pub fn valid_for(&self, margin: Duration) -> bool {
        SystemTime::now()
            .checked_add(margin)
            .is_some_and(|threshold| self.not_after > threshold)
    }

    /// Colon-separated hex rendering of the serial, as `openssl` prints it.
    #[must_use]
    pub fn serial_hex(&self) -> String {
        self.serial
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// `not_after` as seconds since the Unix epoch, for log fields.
    #[must_use]
    pub fn not_after_unix(&self) -> u64 {
        self.not_after
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

// ─────────────────────────────────────────────────────────────────────────────
// Client certificate
// ─────────────────────────────────────────────────────────────────────────────

/// A client certificate chain with its private key.
///
/// Values are immutable once built; providers hand them out behind an
/// `Arc` and replace the whole value on renewal.
pub struct ClientCertificate {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    leaf: Option<LeafInfo>,
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("chain_len", &self.chain.len())
            .field("leaf", &self.leaf)
            .finish_non_exhaustive()
    }
}

impl ClientCertificate {
    /// Build from an already decoded chain and key. The leaf is parsed
    /// lazily by whoever needs it.
    #[must_use]
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self {
            chain,
            key,
            leaf: None,
        }
    }

    /// Attach pre-parsed leaf metadata.
    #[must_use]
    pub fn with_leaf(mut self, leaf: LeafInfo) -> Self {
        self.leaf = Some(leaf);
        self
    }

    /// Decode a PEM chain and PEM private key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if either input has no usable PEM block.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Certificate(format!("Failed to parse certificates: {e}")))?;
        if chain.is_empty() {
            return Err(Error::Certificate("No certificates found".to_string()));
        }

        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| Error::Certificate(format!("Failed to parse private key: {e}")))?;

        Ok(Self::new(chain, key))
    }

    /// Read and decode a PEM chain file and a PEM key file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if a file cannot be read or parsed.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;
        Self::from_pem(&cert_pem, &key_pem).map_err(|e| {
            Error::Certificate(format!(
                "{e} (cert '{}', key '{}')",
                cert_path.display(),
                key_path.display()
            ))
        })
    }

    /// The certificate chain, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// A copy of the private key, for handing to a TLS config.
    #[must_use]
    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Leaf metadata, if already populated.
    #[must_use]
    pub fn leaf(&self) -> Option<&LeafInfo> {
        self.leaf.as_ref()
    }

    /// Populate leaf metadata from the first chain entry if missing.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the chain is empty or the leaf does
    /// not parse.
    pub fn ensure_leaf(&mut self) -> Result<&LeafInfo> {
        if self.leaf.is_none() {
            let der = self
                .chain
                .first()
                .ok_or_else(|| Error::Certificate("Certificate chain is empty".to_string()))?;
            self.leaf = Some(LeafInfo::parse(der)?);
        }
        self.leaf
            .as_ref()
            .ok_or_else(|| Error::Internal("leaf metadata missing after parse".to_string()))
    }
}

/// Read trust anchors from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no certificate.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem_data)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Certificate(format!(
                "Failed to parse certs from '{}': {e}",
                path.display()
            ))
        })?;

    if certs.is_empty() {
        return Err(Error::Certificate(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::Certificate(format!("Cannot read '{}': {e}", path.display())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestCa, unix_time};

    #[test]
    fn leaf_info_reads_serial_expiry_and_cn() {
        let ca = TestCa::new();
        let issued = ca.issue_client("ci-publisher", 42, unix_time(4_000_000_000));

        let leaf = LeafInfo::parse(issued.cert_der.as_ref()).unwrap();
        assert_eq!(leaf.subject, "ci-publisher");
        assert_eq!(leaf.serial, vec![42]);
        assert_eq!(leaf.not_after_unix(), 4_000_000_000);
        assert!(leaf.valid_for(Duration::from_secs(120)));
    }

    #[test]
    fn leaf_info_rejects_garbage() {
        assert!(LeafInfo::parse(b"not a cert").is_err());
    }

    #[test]
    fn valid_for_honours_margin() {
        let leaf = LeafInfo {
            not_after: SystemTime::now() + Duration::from_secs(60),
            serial: vec![1],
            subject: "x".into(),
        };
        assert!(leaf.valid_for(Duration::ZERO));
        assert!(!leaf.valid_for(Duration::from_secs(120)));
    }

    #[test]
    fn serial_hex_is_colon_separated() {
        let leaf = LeafInfo {
            not_after: UNIX_EPOCH,
            serial: vec![0x0a, 0xff, 0x01],
            subject: String::new(),
        };
        assert_eq!(leaf.serial_hex(), "0a:ff:01");
    }

    #[test]
    fn from_pem_files_round_trips_generated_material() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCa::new();
        let issued = ca.issue_client("agent", 7, unix_time(4_000_000_000));
        let (cert_path, key_path) = issued.write_to(dir.path(), "client");

        let mut cert = ClientCertificate::from_pem_files(&cert_path, &key_path).unwrap();
        assert_eq!(cert.chain().len(), 1);
        assert!(cert.leaf().is_none());
        assert_eq!(cert.ensure_leaf().unwrap().serial, vec![7]);
        assert!(!cert.key().secret_der().is_empty());
    }

    #[test]
    fn from_pem_rejects_missing_key() {
        let ca = TestCa::new();
        let issued = ca.issue_client("agent", 7, unix_time(4_000_000_000));
        let result = ClientCertificate::from_pem(issued.cert_pem.as_bytes(), b"");
        assert!(result.is_err());
    }

    #[test]
    fn from_pem_files_reports_missing_file() {
        let err = ClientCertificate::from_pem_files(
            Path::new("/nonexistent/tls.crt"),
            Path::new("/nonexistent/tls.key"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Cannot read"));
    }

    #[test]
    fn load_certs_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, b"").unwrap();
        assert!(load_certs(&path).is_err());
    }

    #[test]
    fn debug_output_hides_key() {
        let ca = TestCa::new();
        let issued = ca.issue_client("agent", 7, unix_time(4_000_000_000));
        let cert = ClientCertificate::from_pem(
            issued.cert_pem.as_bytes(),
            issued.key_pem.as_bytes(),
        )
        .unwrap();
        let rendered = format!("{cert:?}");
        assert!(rendered.contains("chain_len"));
        assert!(!rendered.contains("PRIVATE"));
    }
}
