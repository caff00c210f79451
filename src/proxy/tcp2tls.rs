//! Plaintext TCP in, (m)TLS out.
//!
//! [`Tcp2TlsProxy`] listens on an ephemeral loopback port and tunnels every
//! accepted connection through a freshly dialed TLS connection to one fixed
//! destination. The client certificate is fetched per connection, so a
//! renewed certificate is used from the next connection on.
//!
//! Shutdown is cooperative: cancelling the serving context stops accepting,
//! lets in-flight connections finish, and only then closes the listener.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::ctxcopy::{Transferred, copy_bidirectional};
use crate::context::Context;
use crate::tls::{ClientCertProvider, TlsClientSettings};
use crate::{Error, Result};

/// Pause after a failed `accept` so that resource exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Lifecycle of a [`Tcp2TlsProxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Constructed, not yet bound.
    Idle,
    /// Bound and accepting connections.
    Listening,
    /// No longer accepting; waiting for in-flight connections.
    Draining,
    /// Listener closed.
    Closed,
    /// Binding the listener failed.
    Failed,
}

/// How proxied connections ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Ran to EOF in both directions.
    pub completed: u64,
    /// Failed while the proxy was serving; logged as warnings.
    pub failed: u64,
    /// Failed after shutdown began; logged at debug level only.
    pub interrupted: u64,
}

/// Shutdown flag and outcome counters shared with connection tasks.
#[derive(Default)]
struct Outcomes {
    stopping: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
}

impl Outcomes {
    fn record(&self, peer: SocketAddr, result: Result<Transferred>) {
        match result {
            Ok(moved) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    %peer,
                    sent = moved.a_to_b,
                    received = moved.b_to_a,
                    "Connection closed"
                );
            }
            Err(e) if self.stopping.load(Ordering::Acquire) => {
                self.interrupted.fetch_add(1, Ordering::Relaxed);
                debug!(%peer, error = %e, "Connection ended during shutdown");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%peer, error = %e, "Proxied connection failed");
            }
        }
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Destination
// ─────────────────────────────────────────────────────────────────────────────

struct Destination {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    cert_provider: Option<Arc<dyn ClientCertProvider>>,
    tls: TlsClientSettings,
}

impl Destination {
    async fn dial(&self, ctx: &Context) -> Result<TlsStream<TcpStream>> {
        let cert = match &self.cert_provider {
            Some(provider) => Some(provider.client_certificate(ctx).await?),
            None => None,
        };
        let config = self.tls.client_config(cert.as_deref())?;

        let tcp = ctx
            .run(TcpStream::connect((self.host.as_str(), self.port)))
            .await?
            .map_err(|e| Error::Proxy(format!("dial {}:{}: {e}", self.host, self.port)))?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on destination socket");
        }

        ctx.run(TlsConnector::from(config).connect(self.server_name.clone(), tcp))
            .await?
            .map_err(|e| {
                Error::Tls(format!(
                    "TLS handshake with {}:{} failed: {e}",
                    self.host, self.port
                ))
            })
    }

    async fn forward(&self, ctx: &Context, mut client: TcpStream) -> Result<Transferred> {
        let mut upstream = self.dial(ctx).await?;
        copy_bidirectional(ctx, &mut client, &mut upstream).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy
// ─────────────────────────────────────────────────────────────────────────────

/// Local plaintext endpoint tunnelling to a remote TLS endpoint.
pub struct Tcp2TlsProxy {
    destination: Arc<Destination>,
    addr: OnceLock<SocketAddr>,
    state: watch::Sender<ProxyState>,
    serving: AtomicBool,
    outcomes: Arc<Outcomes>,
    connections: TaskTracker,
}

impl fmt::Debug for Tcp2TlsProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcp2TlsProxy")
            .field("host", &self.destination.host)
            .field("port", &self.destination.port)
            .field("mtls", &self.destination.cert_provider.is_some())
            .field("addr", &self.addr.get())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Tcp2TlsProxy {
    /// Proxy to `host:port`, presenting certificates from `cert_provider`
    /// when given and verifying the destination against `tls`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `host` is not a valid TLS server name.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        cert_provider: Option<Arc<dyn ClientCertProvider>>,
        tls: TlsClientSettings,
    ) -> Result<Self> {
        let host = host.into();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| Error::Config(format!("Invalid proxy destination '{host}': {e}")))?;

        Ok(Self {
            destination: Arc::new(Destination {
                host,
                port,
                server_name,
                cert_provider,
                tls,
            }),
            addr: OnceLock::new(),
            state: watch::Sender::new(ProxyState::Idle),
            serving: AtomicBool::new(false),
            outcomes: Arc::new(Outcomes::default()),
            connections: TaskTracker::new(),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProxyState {
        *self.state.borrow()
    }

    /// Number of connections currently being proxied.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Outcomes of the connections that have ended so far.
    #[must_use]
    pub fn connection_stats(&self) -> ConnectionStats {
        self.outcomes.snapshot()
    }

    /// Bind `127.0.0.1:0` and serve until `ctx` is done, then drain.
    ///
    /// Waiters in [`get_address`](Self::get_address) are released whether
    /// or not binding succeeds. Proxied connections run on a context that
    /// keeps `ctx`'s deadline but not its cancellation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Proxy` if the proxy was already started or the
    /// listener cannot be bound.
    pub async fn listen_and_serve(&self, ctx: &Context) -> Result<()> {
        if self.serving.swap(true, Ordering::AcqRel) {
            return Err(Error::Proxy("proxy has already been started".to_string()));
        }

        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state.send_replace(ProxyState::Failed);
                return Err(Error::Proxy(format!("listen on 127.0.0.1: {e}")));
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.state.send_replace(ProxyState::Failed);
                return Err(Error::Proxy(format!("read listener address: {e}")));
            }
        };
        let _ = self.addr.set(addr);
        self.state.send_replace(ProxyState::Listening);
        info!(
            %addr,
            destination = %format_args!("{}:{}", self.destination.host, self.destination.port),
            mtls = self.destination.cert_provider.is_some(),
            "TCP to TLS proxy listening"
        );

        self.accept_loop(ctx, &listener).await;

        self.outcomes.stopping.store(true, Ordering::Release);
        self.state.send_replace(ProxyState::Draining);
        self.connections.close();
        debug!(%addr, in_flight = self.connections.len(), "Draining proxied connections");
        self.connections.wait().await;

        drop(listener);
        self.state.send_replace(ProxyState::Closed);
        info!(%addr, "TCP to TLS proxy stopped");
        Ok(())
    }

    async fn accept_loop(&self, ctx: &Context, listener: &TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                () = ctx.done() => return,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.spawn_connection(ctx.detached(), stream, peer),
                Err(e) => {
                    if ctx.is_done() {
                        return;
                    }
                    warn!(error = %e, "Accept failed, continuing");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    fn spawn_connection(&self, ctx: Context, stream: TcpStream, peer: SocketAddr) {
        let destination = Arc::clone(&self.destination);
        let outcomes = Arc::clone(&self.outcomes);
        debug!(%peer, "Accepted connection");

        self.connections.spawn(async move {
            let result = destination.forward(&ctx, stream).await;
            outcomes.record(peer, result);
        });
    }

    /// The bound listener address.
    ///
    /// Waits for [`listen_and_serve`](Self::listen_and_serve) to bind,
    /// not for it to return.
    ///
    /// # Errors
    ///
    /// Returns the context error if `ctx` is done first, or `Error::Proxy`
    /// if binding failed.
    pub async fn get_address(&self, ctx: &Context) -> Result<SocketAddr> {
        let mut rx = self.state.subscribe();
        ctx.run(async {
            // The sender lives in `self`, so the channel cannot close here.
            let _ = rx.wait_for(|state| *state != ProxyState::Idle).await;
        })
        .await?;

        self.addr
            .get()
            .copied()
            .ok_or_else(|| Error::Proxy("proxy failed to start listening".to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
