//! Command runner with lifecycle hooks.
//!
//! A [`Runner`] executes external commands, surrounding each one with the
//! hooks it was given:
//!
//! 1. **setup**: once, lazily before the first command (or via
//!    [`Runner::setup`]). Stops at the first failure and is retried on the
//!    next run.
//! 2. **pre-command**: may rewrite the program name and arguments.
//! 3. **command**: may mutate the [`ProcessSpec`] (environment mostly).
//! 4. **cleanup**: every hook, on [`Runner::close`], no matter what failed
//!    before. Failures are collected, not short-circuited.
//!
//! Hooks run sequentially in registration order within every phase.

pub mod hook;
pub mod process;

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use hook::{Capabilities, CleanupHook, CommandHook, Hook, PreCommandHook, SetupHook};
pub use process::ProcessSpec;

use crate::context::Context;
use crate::{Error, HookPhase, Result};

struct Registered {
    hook: Arc<dyn Hook>,
    caps: Capabilities,
}

impl Registered {
    fn name(&self) -> &str {
        self.hook.name()
    }
}

/// Runs commands surrounded by hooks. See the [module docs](self).
pub struct Runner {
    hooks: Vec<Registered>,
    setup_lock: Mutex<()>,
    setup_ran: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field(
                "hooks",
                &self.hooks.iter().map(Registered::name).collect::<Vec<_>>(),
            )
            .field("setup_ran", &self.setup_ran.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Runner {
    /// Runner with `hooks` in invocation order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a hook exposes no capability.
    pub fn new(hooks: impl IntoIterator<Item = Arc<dyn Hook>>) -> Result<Self> {
        let mut runner = Self {
            hooks: Vec::new(),
            setup_lock: Mutex::new(()),
            setup_ran: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        for hook in hooks {
            runner.register(hook)?;
        }
        Ok(runner)
    }

    /// Append a hook.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` once setup has run or the runner is closed,
    /// since the hook would miss phases the others already went through.
    /// Also rejects hooks exposing no capability.
    pub fn register(&mut self, hook: Arc<dyn Hook>) -> Result<()> {
        let name = hook.name().to_string();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Config(format!(
                "Cannot register hook '{name}': runner is closed"
            )));
        }
        if self.setup_ran.load(Ordering::Acquire) {
            return Err(Error::Config(format!(
                "Cannot register hook '{name}': setup has already run"
            )));
        }

        let caps = Capabilities::of(hook.as_ref());
        if caps.is_empty() {
            return Err(Error::Config(format!(
                "Hook '{name}' implements no lifecycle capability"
            )));
        }
        debug!(hook = %name, capabilities = %caps, "Registered hook");
        self.hooks.push(Registered { hook, caps });
        Ok(())
    }

    /// Registered hook names in order.
    #[must_use]
    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(Registered::name).collect()
    }

    /// Whether every setup hook has succeeded.
    #[must_use]
    pub fn setup_ran(&self) -> bool {
        self.setup_ran.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Config("Runner is closed".to_string()));
        }
        Ok(())
    }

    /// Run setup hooks unless they already succeeded.
    ///
    /// # Errors
    ///
    /// Returns the first failing hook's error wrapped with its name. Later
    /// setup hooks are skipped and the next call starts over.
    pub async fn setup(&self, ctx: &Context) -> Result<()> {
        if self.setup_ran() {
            return Ok(());
        }
        let _guard = ctx.run(self.setup_lock.lock()).await?;
        if self.setup_ran() {
            return Ok(());
        }
        self.ensure_open()?;

        for registered in self.hooks.iter().filter(|r| r.caps.setup) {
            let Some(hook) = registered.hook.as_setup() else {
                continue;
            };
            ctx.check()?;
            debug!(hook = registered.name(), "Running setup hook");
            hook.setup(ctx)
                .await
                .map_err(|e| Error::hook(registered.name(), HookPhase::Setup, e))?;
        }

        self.setup_ran.store(true, Ordering::Release);
        info!(hooks = self.hooks.len(), "Runner setup complete");
        Ok(())
    }

    /// Run setup if needed, then the pre-command and command phases, and
    /// return the process that would be executed.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure; later hooks of that phase are skipped.
    pub async fn prepare(
        &self,
        ctx: &Context,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<ProcessSpec> {
        self.ensure_open()?;
        self.setup(ctx).await?;

        let mut program = program.into();
        let mut args: Vec<String> = args.into_iter().map(Into::into).collect();
        for registered in self.hooks.iter().filter(|r| r.caps.pre_command) {
            let Some(hook) = registered.hook.as_pre_command() else {
                continue;
            };
            ctx.check()?;
            hook.pre_command(ctx, &mut program, &mut args)
                .await
                .map_err(|e| Error::hook(registered.name(), HookPhase::PreCommand, e))?;
        }

        let mut process = ProcessSpec::new(program, args);
        for registered in self.hooks.iter().filter(|r| r.caps.command) {
            let Some(hook) = registered.hook.as_command() else {
                continue;
            };
            ctx.check()?;
            hook.command(ctx, &mut process)
                .await
                .map_err(|e| Error::hook(registered.name(), HookPhase::Command, e))?;
        }
        Ok(process)
    }

    /// Run `program` with inherited stdio.
    ///
    /// The child is killed if `ctx` is done before it exits.
    ///
    /// # Errors
    ///
    /// Returns hook failures, spawn failures, the context error, or
    /// `Error::CommandFailed` for a non-zero exit.
    pub async fn run(
        &self,
        ctx: &Context,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<()> {
        let process = self.prepare(ctx, program, args).await?;
        let mut command = process.to_command();
        info!(command = %process.render(), "Running command");

        let status = ctx
            .run(command.status())
            .await?
            .map_err(|e| spawn_error(&process, e))?;
        check_status(&process, status)
    }

    /// Like [`run`](Self::run) but captures and returns stdout.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn output(
        &self,
        ctx: &Context,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Vec<u8>> {
        let process = self.prepare(ctx, program, args).await?;
        let mut command = process.to_command();
        command.stdout(Stdio::piped());
        debug!(command = %process.render(), "Running command with captured output");

        let output = ctx
            .run(command.output())
            .await?
            .map_err(|e| spawn_error(&process, e))?;
        check_status(&process, output.status)?;
        Ok(output.stdout)
    }

    /// Run every cleanup hook, once.
    ///
    /// Later calls are no-ops. All hooks run even if earlier ones fail.
    ///
    /// # Errors
    ///
    /// Returns the failures of all cleanup hooks joined together.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = Vec::new();
        for registered in self.hooks.iter().filter(|r| r.caps.cleanup) {
            let Some(hook) = registered.hook.as_cleanup() else {
                continue;
            };
            debug!(hook = registered.name(), "Running cleanup hook");
            if let Err(e) = hook.cleanup(ctx).await {
                warn!(hook = registered.name(), error = %e, "Cleanup hook failed");
                errors.push(Error::hook(registered.name(), HookPhase::Cleanup, e));
            }
        }

        Error::join(errors).map_or(Ok(()), Err)
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) && !self.hooks.is_empty() {
            warn!("Runner dropped without close; cleanup hooks did not run");
        }
    }
}

fn spawn_error(process: &ProcessSpec, e: std::io::Error) -> Error {
    Error::Io(std::io::Error::new(
        e.kind(),
        format!("failed to run '{}': {e}", process.render()),
    ))
}

fn check_status(process: &ProcessSpec, status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    Err(Error::CommandFailed {
        command: process.render(),
        status,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
