//! hookrun - run CLI tools behind lifecycle hooks
//!
//! `hookrun exec` wraps one program invocation with the hooks enabled in
//! configuration; `hookrun proxy` runs the TCP to TLS tunnel on its own.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use hookrun::{
    Error,
    cli::{Cli, Command},
    config::{Config, MtlsConfig},
    context::Context,
    hooks::{self, EnvHook},
    proxy::Tcp2TlsProxy,
    runner::Runner,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, Some(cli.log_format.as_str())) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Exec { env, program, args } => run_exec(&config, &env, program, args).await,
        Command::Proxy {
            host,
            port,
            client_cert,
            client_key,
            ca_certs,
        } => run_proxy(host, port, client_cert.zip(client_key), ca_certs).await,
    }
}

/// Run one program with the configured hooks; cleanup always runs.
async fn run_exec(config: &Config, env: &[String], program: String, args: Vec<String>) -> ExitCode {
    let extra = match EnvHook::from_assignments("cli-env", env) {
        Ok(hook) => hook,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let runner = match hooks::from_config(config, Some(extra)).and_then(Runner::new) {
        Ok(runner) => runner,
        Err(e) => {
            error!("Failed to prepare hooks: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hooks = ?runner.hook_names(),
        %program,
        "Starting hookrun"
    );

    let ctx = Context::background();
    let interrupt = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            ctx.cancel();
        })
    };

    let result = runner.run(&ctx, program, args).await;
    interrupt.abort();

    // Cleanup must not be cut short by the interrupt that ended the run.
    let cleanup = runner.close(&Context::background()).await;

    let mut code = ExitCode::SUCCESS;
    if let Err(e) = result {
        error!("{e}");
        code = exit_code_for(&e);
    }
    if let Err(e) = cleanup {
        error!("Cleanup failed: {e}");
        code = ExitCode::FAILURE;
    }
    code
}

/// Child exit codes are passed through; anything else is a plain failure.
fn exit_code_for(err: &Error) -> ExitCode {
    match err {
        Error::CommandFailed { status, .. } => status
            .code()
            .and_then(|code| u8::try_from(code).ok())
            .filter(|&code| code != 0)
            .map_or(ExitCode::FAILURE, ExitCode::from),
        _ => ExitCode::FAILURE,
    }
}

/// Serve a standalone proxy until Ctrl+C / SIGTERM, then drain.
async fn run_proxy(
    host: String,
    port: u16,
    client_cert: Option<(PathBuf, PathBuf)>,
    ca_certs: Vec<PathBuf>,
) -> ExitCode {
    let mtls = MtlsConfig {
        enabled: true,
        host,
        port,
        client_cert: client_cert
            .as_ref()
            .map(|(cert, _)| cert.display().to_string()),
        client_key: client_cert
            .as_ref()
            .map(|(_, key)| key.display().to_string()),
        ca_certs: ca_certs.iter().map(|p| p.display().to_string()).collect(),
        ..MtlsConfig::default()
    };

    let proxy = match hooks::tls_settings(&mtls).and_then(|tls| {
        Tcp2TlsProxy::new(
            mtls.host.clone(),
            mtls.port,
            hooks::cert_provider(&mtls),
            tls,
        )
    }) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            error!("Failed to create proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    let ctx = Context::background();
    let server = {
        let proxy = Arc::clone(&proxy);
        let ctx = ctx.clone();
        tokio::spawn(async move { proxy.listen_and_serve(&ctx).await })
    };

    match proxy.get_address(&ctx).await {
        Ok(addr) => println!("{addr}"),
        Err(e) => {
            error!("Proxy failed to start: {e}");
            if let Ok(Err(e)) = server.await {
                error!("{e}");
            }
            return ExitCode::FAILURE;
        }
    }

    shutdown_signal().await;
    ctx.cancel();
    info!(in_flight = proxy.active_connections(), "Draining proxy");

    match server.await {
        Ok(Ok(())) => {
            info!("Proxy shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Proxy error: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Proxy task failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
