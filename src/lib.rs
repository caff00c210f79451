//! hookrun Library
//!
//! Runs external CLI tools surrounded by lifecycle hooks, and tunnels their
//! traffic through a local TCP to mTLS proxy so that client certificates
//! never reach the tool's disk or environment.
//!
//! # Features
//!
//! - **Command runner**: setup / pre-command / command / cleanup hooks in
//!   registration order, cleanup guaranteed on [`runner::Runner::close`]
//! - **TCP to TLS proxy**: ephemeral loopback listener, fresh client
//!   certificate per connection, drain before close
//! - **Certificate renewal**: cached client certificate renewed shortly
//!   before expiry by a single caller at a time
//! - **Keyed locks**: context-aware [`sync::ContextLock`] and
//!   [`sync::MutexMap`], used for download de-duplication in
//!   [`files::FileManager`]
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use hookrun::context::Context;
//! use hookrun::hooks::EnvHook;
//! use hookrun::runner::{Hook, Runner};
//!
//! # tokio_test::block_on(async {
//! let hook: Arc<dyn Hook> = Arc::new(EnvHook::new("env", [("TEST_VAR", "hello")]));
//! let runner = Runner::new([hook])?;
//! let ctx = Context::background();
//!
//! let stdout = runner
//!     .output(&ctx, "sh", ["-c", "printf %s \"$TEST_VAR\""])
//!     .await?;
//! assert_eq!(stdout, b"hello");
//!
//! runner.close(&ctx).await?;
//! # Ok::<(), hookrun::Error>(())
//! # }).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod files;
pub mod hooks;
pub mod proxy;
pub mod runner;
pub mod sync;
pub mod tls;

#[cfg(test)]
mod test_support;

pub use error::{Error, HookPhase, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// Only the binary calls this; library code emits events and leaves the
/// subscriber to the embedding application.
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
