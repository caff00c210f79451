//! Error types for hookrun

use std::fmt;
use std::io;
use std::process::ExitStatus;

use thiserror::Error;

/// Result type alias for hookrun
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle phase a hook error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// One-time setup before the first command
    Setup,
    /// Argument rewriting before the process is built
    PreCommand,
    /// Process mutation before it is spawned
    Command,
    /// Teardown when the runner is closed
    Cleanup,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Setup => "setup",
            Self::PreCommand => "pre-command",
            Self::Command => "command",
            Self::Cleanup => "cleanup",
        })
    }
}

/// hookrun errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate could not be loaded, parsed or retrieved
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Cached certificate expired and the source stopped rotating it
    #[error("client certificate expired at {not_after} and cannot be renewed")]
    CertificateExpired {
        /// Expiry of the last certificate seen, RFC 3339-ish
        not_after: String,
    },

    /// The context was cancelled
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A lock was closed while waiting for it
    #[error("lock closed")]
    LockClosed,

    /// A hook failed
    #[error("{phase} hook '{hook}' failed: {source}")]
    Hook {
        /// Hook name
        hook: String,
        /// Phase the hook failed in
        phase: HookPhase,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// The external process exited unsuccessfully
    #[error("command `{command}` failed: {status}")]
    CommandFailed {
        /// Rendered command line, env vars prefixed
        command: String,
        /// Exit status
        status: ExitStatus,
    },

    /// Proxy error
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Several independent failures
    #[error("{}", render_joined(.0))]
    Joined(Vec<Error>),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a failure from a hook
    pub fn hook(hook: impl Into<String>, phase: HookPhase, source: Error) -> Self {
        Self::Hook {
            hook: hook.into(),
            phase,
            source: Box::new(source),
        }
    }

    /// Join independent errors: `None` when empty, the error itself when
    /// there is exactly one.
    #[must_use]
    pub fn join(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Joined(errors)),
        }
    }

    /// Whether this error was caused by context cancellation or deadline
    #[must_use]
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

fn render_joined(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_of_nothing_is_none() {
        assert!(Error::join(Vec::new()).is_none());
    }

    #[test]
    fn join_of_one_is_that_error() {
        let err = Error::join(vec![Error::Cancelled]).unwrap();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn join_of_many_renders_all() {
        let err = Error::join(vec![
            Error::Proxy("a".to_string()),
            Error::Proxy("b".to_string()),
        ])
        .unwrap();
        assert_eq!(err.to_string(), "Proxy error: a; Proxy error: b");
    }

    #[test]
    fn hook_error_names_hook_and_phase() {
        let err = Error::hook("gpg-home", HookPhase::Setup, Error::Internal("boom".into()));
        let msg = err.to_string();
        assert!(msg.contains("setup hook 'gpg-home' failed"));
        assert!(msg.contains("boom"));
    }
}
