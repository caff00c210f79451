//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Run CLI tools behind lifecycle hooks: a local mTLS tunnel, a throwaway
/// GPG home, extra environment
#[derive(Parser, Debug)]
#[command(name = "hookrun")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "HOOKRUN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HOOKRUN_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format
    #[arg(
        long,
        value_enum,
        default_value_t = LogFormat::Text,
        env = "HOOKRUN_LOG_FORMAT",
        global = true
    )]
    pub log_format: LogFormat,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Name understood by [`crate::setup_tracing`].
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a program once with the configured hooks
    Exec {
        /// Extra environment variable for the program (KEY=VALUE, repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Program to run
        #[arg(required = true)]
        program: String,

        /// Arguments for the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run a standalone TCP to TLS proxy until interrupted
    Proxy {
        /// Destination host
        #[arg(long)]
        host: String,

        /// Destination port
        #[arg(long, default_value_t = 443)]
        port: u16,

        /// PEM client certificate chain (enables mTLS)
        #[arg(long, requires = "client_key")]
        client_cert: Option<PathBuf>,

        /// PEM private key for the client certificate
        #[arg(long, requires = "client_cert")]
        client_key: Option<PathBuf>,

        /// Extra PEM CA bundle to trust (repeatable)
        #[arg(long = "ca-cert")]
        ca_certs: Vec<PathBuf>,
    },
}
