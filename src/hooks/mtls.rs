//! Points a CLI at a local mTLS tunnel.
//!
//! [`MtlsProxyHook`] starts a [`Tcp2TlsProxy`] during setup, tells every
//! command where it listens through an environment variable, and tears it
//! down (with drain) during cleanup. The wrapped tool only ever sees a
//! plaintext `http://127.0.0.1:<port>` endpoint; the client certificate
//! never touches its environment.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::context::Context;
use crate::proxy::Tcp2TlsProxy;
use crate::runner::{CleanupHook, CommandHook, Hook, ProcessSpec, SetupHook};
use crate::tls::{ClientCertProvider, TlsClientSettings};
use crate::{Error, Result};

/// Hook name used in logs and errors.
pub const MTLS_HOOK_NAME: &str = "mtls-proxy";

/// Environment variable receiving the proxy endpoint unless configured.
pub const DEFAULT_ENDPOINT_ENV: &str = "ATTUNE_API_ENDPOINT";

struct Running {
    ctx: Context,
    addr: SocketAddr,
    task: JoinHandle<Result<()>>,
}

/// Runs a TCP to TLS proxy for the lifetime of a runner.
pub struct MtlsProxyHook {
    host: String,
    port: u16,
    cert_provider: Option<Arc<dyn ClientCertProvider>>,
    tls: TlsClientSettings,
    endpoint_env: String,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for MtlsProxyHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsProxyHook")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("endpoint_env", &self.endpoint_env)
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl MtlsProxyHook {
    /// Tunnel to `host:port`, presenting certificates from `cert_provider`.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        cert_provider: Option<Arc<dyn ClientCertProvider>>,
        tls: TlsClientSettings,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            cert_provider,
            tls,
            endpoint_env: DEFAULT_ENDPOINT_ENV.to_string(),
            running: Mutex::new(None),
        }
    }

    /// Override the environment variable receiving the endpoint URL.
    #[must_use]
    pub fn with_endpoint_env(mut self, name: impl Into<String>) -> Self {
        self.endpoint_env = name.into();
        self
    }

    /// Local proxy address while running.
    #[must_use]
    pub fn address(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }
}

impl Hook for MtlsProxyHook {
    fn name(&self) -> &str {
        MTLS_HOOK_NAME
    }

    fn as_setup(&self) -> Option<&dyn SetupHook> {
        Some(self)
    }

    fn as_command(&self) -> Option<&dyn CommandHook> {
        Some(self)
    }

    fn as_cleanup(&self) -> Option<&dyn CleanupHook> {
        Some(self)
    }
}

#[async_trait]
impl SetupHook for MtlsProxyHook {
    async fn setup(&self, ctx: &Context) -> Result<()> {
        if self.address().is_some() {
            return Ok(());
        }

        let proxy = Arc::new(Tcp2TlsProxy::new(
            self.host.clone(),
            self.port,
            self.cert_provider.clone(),
            self.tls.clone(),
        )?);

        // The proxy outlives the setup call; cleanup stops it.
        let serve_ctx = Context::background();
        let task = {
            let proxy = Arc::clone(&proxy);
            let serve_ctx = serve_ctx.clone();
            tokio::spawn(async move { proxy.listen_and_serve(&serve_ctx).await })
        };

        let addr = match proxy.get_address(ctx).await {
            Ok(addr) => addr,
            Err(e) => {
                serve_ctx.cancel();
                // A bind failure is reported in more detail by the serve task.
                return match task.await {
                    Ok(Err(serve_err)) => Err(serve_err),
                    _ => Err(e),
                };
            }
        };

        info!(
            %addr,
            destination = %format_args!("{}:{}", self.host, self.port),
            env = %self.endpoint_env,
            "mTLS proxy started"
        );
        *self.running.lock() = Some(Running {
            ctx: serve_ctx,
            addr,
            task,
        });
        Ok(())
    }
}

#[async_trait]
impl CommandHook for MtlsProxyHook {
    async fn command(&self, _ctx: &Context, process: &mut ProcessSpec) -> Result<()> {
        let addr = self
            .address()
            .ok_or_else(|| Error::Proxy("mTLS proxy is not running".to_string()))?;
        process.set_env(&self.endpoint_env, format!("http://{addr}"));
        Ok(())
    }
}

#[async_trait]
impl CleanupHook for MtlsProxyHook {
    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        debug!(addr = %running.addr, "Stopping mTLS proxy");
        running.ctx.cancel();
        ctx.run(running.task)
            .await?
            .map_err(|e| Error::Internal(format!("proxy task failed: {e}")))?
    }
}
