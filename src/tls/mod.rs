//! TLS client material for the tunneling proxy.
//!
//! # Modules
//!
//! - [`certificate`]: PEM loading and X.509 leaf inspection (`ClientCertificate`, `LeafInfo`)
//! - [`provider`]: certificate sources and the renewing cache (`RenewableCertProvider`)
//! - [`client`]: per-connection rustls client configs (`TlsClientSettings`)

pub mod certificate;
pub mod client;
pub mod provider;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

pub use certificate::{ClientCertificate, LeafInfo, load_certs};
pub use client::TlsClientSettings;
pub use provider::{
    CertificateSource, ClientCertProvider, DEFAULT_RENEW_BEFORE, PemFileSource,
    RenewableCertProvider, StaticCertProvider,
};

/// The aws-lc-rs crypto provider, passed explicitly so no process-wide
/// default has to be installed.
#[must_use]
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}
