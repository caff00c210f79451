//! Client certificate providers.
//!
//! The proxy asks a [`ClientCertProvider`] for a certificate on every new
//! connection. [`RenewableCertProvider`] caches the certificate obtained
//! from a [`CertificateSource`] and fetches a fresh one shortly before the
//! cached one expires.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::certificate::ClientCertificate;
use crate::context::Context;
use crate::{Error, Result};

/// Renew this long before the cached certificate expires unless configured
/// otherwise.
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(120);

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Supplies client certificates to TLS dialers.
#[async_trait]
pub trait ClientCertProvider: Send + Sync {
    /// A certificate that is currently usable.
    async fn client_certificate(&self, ctx: &Context) -> Result<Arc<ClientCertificate>>;
}

/// Retrieves a fresh certificate from wherever it is issued.
///
/// Implementations are not required to abort when `ctx` is cancelled. A
/// fetch that never returns blocks every later renewal attempt.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// Fetch the current certificate.
    async fn fetch(&self, ctx: &Context) -> Result<ClientCertificate>;
}

#[async_trait]
impl<F, Fut> CertificateSource for F
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ClientCertificate>> + Send,
{
    async fn fetch(&self, ctx: &Context) -> Result<ClientCertificate> {
        self(ctx.clone()).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sources and simple providers
// ─────────────────────────────────────────────────────────────────────────────

/// Reads a PEM chain and key from disk on every fetch, so a sidecar that
/// rewrites the files is picked up on the next renewal.
#[derive(Debug, Clone)]
pub struct PemFileSource {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl PemFileSource {
    /// Source reading `cert_path` and `key_path`.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl CertificateSource for PemFileSource {
    async fn fetch(&self, ctx: &Context) -> Result<ClientCertificate> {
        ctx.check()?;
        let cert_pem = tokio::fs::read(&self.cert_path).await.map_err(|e| {
            Error::Certificate(format!("Cannot read '{}': {e}", self.cert_path.display()))
        })?;
        let key_pem = tokio::fs::read(&self.key_path).await.map_err(|e| {
            Error::Certificate(format!("Cannot read '{}': {e}", self.key_path.display()))
        })?;
        debug!(cert = %self.cert_path.display(), "Loaded client certificate from disk");
        ClientCertificate::from_pem(&cert_pem, &key_pem)
    }
}

/// Always hands out the same certificate.
#[derive(Debug, Clone)]
pub struct StaticCertProvider {
    cert: Arc<ClientCertificate>,
}

impl StaticCertProvider {
    /// Provider for `cert`.
    #[must_use]
    pub fn new(cert: ClientCertificate) -> Self {
        Self {
            cert: Arc::new(cert),
        }
    }
}

#[async_trait]
impl ClientCertProvider for StaticCertProvider {
    async fn client_certificate(&self, _ctx: &Context) -> Result<Arc<ClientCertificate>> {
        Ok(Arc::clone(&self.cert))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Renewable provider
// ─────────────────────────────────────────────────────────────────────────────

struct CertState {
    current: Option<Arc<ClientCertificate>>,
    /// Cleared once a renewal hands back the certificate we already had.
    renewable: bool,
}

enum Lookup {
    Valid(Arc<ClientCertificate>),
    Stale,
    Exhausted(String),
}

/// Caches a certificate and renews it `renew_before` ahead of expiry.
///
/// Concurrent callers share the cached certificate under a read lock. When
/// it needs renewing, exactly one caller wins a non-blocking write-lock
/// attempt and fetches; the others go back to reading and pick up the
/// result once the writer is done. The cached value is replaced, never
/// mutated, so an `Arc` handed out earlier stays consistent.
///
/// When the source returns a certificate with the same serial as the cached
/// one, the source is not rotating and renewal stops: once that certificate
/// is no longer valid every call fails with
/// [`Error::CertificateExpired`].
pub struct RenewableCertProvider {
    source: Box<dyn CertificateSource>,
    renew_before: Duration,
    state: RwLock<CertState>,
}

impl RenewableCertProvider {
    /// Empty provider; the first call fetches.
    pub fn new(source: impl CertificateSource + 'static, renew_before: Duration) -> Self {
        Self {
            source: Box::new(source),
            renew_before,
            state: RwLock::new(CertState {
                current: None,
                renewable: true,
            }),
        }
    }

    /// Renewal threshold.
    #[must_use]
    pub fn renew_before(&self) -> Duration {
        self.renew_before
    }

    fn classify(&self, state: &CertState) -> Lookup {
        if let Some(cert) = &state.current {
            if cert.leaf().is_some_and(|leaf| leaf.valid_for(self.renew_before)) {
                return Lookup::Valid(Arc::clone(cert));
            }
        }
        if state.renewable {
            return Lookup::Stale;
        }
        let not_after = state
            .current
            .as_ref()
            .and_then(|cert| cert.leaf())
            .map_or_else(|| "<unknown>".to_string(), |leaf| leaf.not_after_unix().to_string());
        Lookup::Exhausted(not_after)
    }

    async fn lookup(&self, ctx: &Context) -> Result<Lookup> {
        let state = ctx.run(self.state.read()).await?;
        Ok(self.classify(&state))
    }

    /// Fetch and install a new certificate. Returns it if it can be used
    /// right away, even inside the renewal window.
    async fn renew(
        &self,
        ctx: &Context,
        state: &mut CertState,
    ) -> Result<Option<Arc<ClientCertificate>>> {
        ctx.check()?;
        let mut fresh = self.source.fetch(ctx).await?;
        let leaf = fresh.ensure_leaf()?.clone();

        let previous_serial = state
            .current
            .as_ref()
            .and_then(|cert| cert.leaf())
            .map(|prev| prev.serial.clone());
        if previous_serial.as_ref() == Some(&leaf.serial) {
            warn!(
                serial = %leaf.serial_hex(),
                not_after = leaf.not_after_unix(),
                "Certificate source returned the cached certificate, renewal disabled"
            );
            state.renewable = false;
            return Ok(None);
        }

        info!(
            subject = %leaf.subject,
            serial = %leaf.serial_hex(),
            not_after = leaf.not_after_unix(),
            "Client certificate renewed"
        );
        let fresh = Arc::new(fresh);
        state.current = Some(Arc::clone(&fresh));
        Ok(leaf.valid_for(Duration::ZERO).then_some(fresh))
    }
}

#[async_trait]
impl ClientCertProvider for RenewableCertProvider {
    async fn client_certificate(&self, ctx: &Context) -> Result<Arc<ClientCertificate>> {
        loop {
            match self.lookup(ctx).await? {
                Lookup::Valid(cert) => return Ok(cert),
                Lookup::Exhausted(not_after) => {
                    return Err(Error::CertificateExpired { not_after });
                }
                Lookup::Stale => {}
            }

            // Losers go back to reading instead of queueing for the write lock.
            let Ok(mut state) = self.state.try_write() else {
                tokio::task::yield_now().await;
                continue;
            };
            // Someone may have renewed between our read and this write lock.
            match self.classify(&state) {
                Lookup::Valid(cert) => return Ok(cert),
                Lookup::Exhausted(not_after) => {
                    return Err(Error::CertificateExpired { not_after });
                }
                Lookup::Stale => {}
            }
            if let Some(cert) = self.renew(ctx, &mut state).await? {
                return Ok(cert);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
