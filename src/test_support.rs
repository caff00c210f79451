//! Certificate fixtures for unit tests, generated with `rcgen`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use time::OffsetDateTime;

use crate::tls::ClientCertificate;

pub fn unix_time(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap()
}

/// Far enough in the future for any test run.
pub fn far_future() -> OffsetDateTime {
    unix_time(4_000_000_000)
}

pub struct Issued {
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
    key_der: Vec<u8>,
}

impl Issued {
    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    pub fn client_certificate(&self) -> ClientCertificate {
        ClientCertificate::new(vec![self.cert_der.clone()], self.key())
    }

    pub fn write_to(&self, dir: &Path, stem: &str) -> (PathBuf, PathBuf) {
        let cert = dir.join(format!("{stem}.crt"));
        let key = dir.join(format!("{stem}.key"));
        std::fs::write(&cert, &self.cert_pem).unwrap();
        std::fs::write(&key, &self.key_pem).unwrap();
        (cert, key)
    }
}

pub struct TestCa {
    issuer: Issuer<'static, KeyPair>,
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
}

impl TestCa {
    pub fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "hookrun test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_after = far_future();
        let cert = params.self_signed(&key).unwrap();

        Self {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            issuer: Issuer::new(params, key),
        }
    }

    fn issue(
        &self,
        cn: &str,
        sans: Vec<String>,
        serial: u8,
        not_after: OffsetDateTime,
        usage: ExtendedKeyUsagePurpose,
    ) -> Issued {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(sans).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.serial_number = Some(SerialNumber::from_slice(&[serial]));
        params.not_before = unix_time(1_500_000_000);
        params.not_after = not_after;
        params.extended_key_usages = vec![usage];
        let cert = params.signed_by(&key, &self.issuer).unwrap();

        Issued {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            key_der: key.serialize_der(),
        }
    }

    /// Client certificate; keep `serial` below 0x80 so it encodes as one byte.
    pub fn issue_client(&self, cn: &str, serial: u8, not_after: OffsetDateTime) -> Issued {
        self.issue(
            cn,
            Vec::new(),
            serial,
            not_after,
            ExtendedKeyUsagePurpose::ClientAuth,
        )
    }

    pub fn issue_server(&self, host: &str) -> Issued {
        self.issue(
            host,
            vec![host.to_string()],
            1,
            far_future(),
            ExtendedKeyUsagePurpose::ServerAuth,
        )
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();
        roots
    }

    /// Server config for `host`, requiring client certificates issued by
    /// this CA when `require_client_cert` is set.
    pub fn server_config(&self, host: &str, require_client_cert: bool) -> Arc<ServerConfig> {
        let provider = crate::tls::crypto_provider();
        let server = self.issue_server(host);
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .unwrap();

        let config = if require_client_cert {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(self.roots()), provider)
                    .build()
                    .unwrap();
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(vec![server.cert_der.clone()], server.key())
                .unwrap()
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(vec![server.cert_der.clone()], server.key())
                .unwrap()
        };
        Arc::new(config)
    }
}
