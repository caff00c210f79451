//! Lifecycle hook capabilities.
//!
//! A hook is a named value exposing any non-empty subset of four
//! capabilities. The runner probes them once, at registration, through the
//! `as_*` accessors; a hook must answer the same way for its whole life.

use async_trait::async_trait;

use super::process::ProcessSpec;
use crate::context::Context;
use crate::Result;

/// A named participant in the command lifecycle.
pub trait Hook: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Runs once before the first command.
    fn as_setup(&self) -> Option<&dyn SetupHook> {
        None
    }

    /// Rewrites the program name and arguments before every command.
    fn as_pre_command(&self) -> Option<&dyn PreCommandHook> {
        None
    }

    /// Adjusts the process (environment, working directory, executable)
    /// before every command.
    fn as_command(&self) -> Option<&dyn CommandHook> {
        None
    }

    /// Releases whatever setup acquired. Always runs on close.
    fn as_cleanup(&self) -> Option<&dyn CleanupHook> {
        None
    }
}

/// One-time preparation.
#[async_trait]
pub trait SetupHook: Send + Sync {
    /// Prepare resources shared by every command.
    async fn setup(&self, ctx: &Context) -> Result<()>;
}

/// Program and argument rewriting.
#[async_trait]
pub trait PreCommandHook: Send + Sync {
    /// Rewrite `program` and `args` in place.
    async fn pre_command(
        &self,
        ctx: &Context,
        program: &mut String,
        args: &mut Vec<String>,
    ) -> Result<()>;
}

/// Process adjustment.
#[async_trait]
pub trait CommandHook: Send + Sync {
    /// Mutate the process about to be started.
    async fn command(&self, ctx: &Context, process: &mut ProcessSpec) -> Result<()>;
}

/// Teardown.
///
/// Cleanup may run without a prior successful setup and must tolerate it.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    /// Release resources.
    async fn cleanup(&self, ctx: &Context) -> Result<()>;
}

/// Which capabilities a hook exposed when it was registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Exposes [`SetupHook`].
    pub setup: bool,
    /// Exposes [`PreCommandHook`].
    pub pre_command: bool,
    /// Exposes [`CommandHook`].
    pub command: bool,
    /// Exposes [`CleanupHook`].
    pub cleanup: bool,
}

impl Capabilities {
    /// Probe `hook`.
    #[must_use]
    pub fn of(hook: &dyn Hook) -> Self {
        Self {
            setup: hook.as_setup().is_some(),
            pre_command: hook.as_pre_command().is_some(),
            command: hook.as_command().is_some(),
            cleanup: hook.as_cleanup().is_some(),
        }
    }

    /// Whether no capability is exposed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !(self.setup || self.pre_command || self.command || self.cleanup)
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = [
            (self.setup, "setup"),
            (self.pre_command, "pre-command"),
            (self.command, "command"),
            (self.cleanup, "cleanup"),
        ]
        .into_iter()
        .filter_map(|(has, name)| has.then_some(name))
        .collect();
        f.write_str(&names.join(","))
    }
}
