//! Built-in hooks.

pub mod env;
pub mod gpg;
pub mod mtls;

use std::sync::Arc;

use tracing::debug;

pub use env::EnvHook;
pub use gpg::{GPG_HOOK_NAME, GpgHomeHook, parse_secret_fingerprint};
pub use mtls::{DEFAULT_ENDPOINT_ENV, MTLS_HOOK_NAME, MtlsProxyHook};

use crate::Result;
use crate::config::{Config, MtlsConfig};
use crate::runner::Hook;
use crate::tls::{
    ClientCertProvider, PemFileSource, RenewableCertProvider, TlsClientSettings,
};

/// Trust store for `mtls`: Mozilla roots plus the configured CA bundles.
///
/// # Errors
///
/// Returns an error if a CA bundle cannot be loaded.
pub fn tls_settings(mtls: &MtlsConfig) -> Result<TlsClientSettings> {
    let mut settings = TlsClientSettings::default();
    for path in mtls.ca_cert_paths() {
        settings.add_pem_file(&path)?;
    }
    Ok(settings)
}

/// Renewing provider over the configured PEM files, if any.
#[must_use]
pub fn cert_provider(mtls: &MtlsConfig) -> Option<Arc<dyn ClientCertProvider>> {
    mtls.client_cert_paths().map(|(cert, key)| {
        Arc::new(RenewableCertProvider::new(
            PemFileSource::new(cert, key),
            mtls.renew_before,
        )) as Arc<dyn ClientCertProvider>
    })
}

/// Hooks enabled in `config`, in invocation order: GPG, mTLS, then `extra`.
///
/// # Errors
///
/// Returns an error if an enabled hook's settings cannot be loaded.
pub fn from_config(config: &Config, extra: Option<EnvHook>) -> Result<Vec<Arc<dyn Hook>>> {
    let mut hooks: Vec<Arc<dyn Hook>> = Vec::new();

    if config.gpg.enabled
        && let Some(key_file) = config.gpg.key_path()
    {
        let hook = GpgHomeHook::new(key_file)
            .with_key_flag(config.gpg.key_flag.clone())
            .with_gpg_command(config.gpg.command()?)?;
        hooks.push(Arc::new(hook));
    }

    if config.mtls.enabled {
        let hook = MtlsProxyHook::new(
            config.mtls.host.clone(),
            config.mtls.port,
            cert_provider(&config.mtls),
            tls_settings(&config.mtls)?,
        )
        .with_endpoint_env(config.mtls.endpoint_env.clone());
        hooks.push(Arc::new(hook));
    }

    if let Some(extra) = extra
        && !extra.vars().is_empty()
    {
        hooks.push(Arc::new(extra));
    }

    debug!(
        hooks = ?hooks.iter().map(|h| h.name()).collect::<Vec<_>>(),
        "Hooks from configuration"
    );
    Ok(hooks)
}
