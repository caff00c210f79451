//! Throwaway GPG home for signing commands.
//!
//! [`GpgHomeHook`] imports an armored secret key into a private temporary
//! `GNUPGHOME` during setup, passes the key's fingerprint to every command
//! as `<key_flag> <fingerprint>`, and deletes the home during cleanup so the
//! decrypted key does not outlive the runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

use crate::context::Context;
use crate::runner::{CleanupHook, CommandHook, Hook, PreCommandHook, ProcessSpec, SetupHook};
use crate::{Error, Result};

/// Hook name used in logs and errors.
pub const GPG_HOOK_NAME: &str = "gpg-home";

/// Flag used to pass the fingerprint unless configured.
pub const DEFAULT_KEY_FLAG: &str = "--key-id";

struct GpgHome {
    dir: TempDir,
    fingerprint: String,
}

/// Imports a signing key into a temporary GPG home.
pub struct GpgHomeHook {
    key_file: PathBuf,
    key_flag: String,
    gpg: Vec<String>,
    home: Mutex<Option<GpgHome>>,
}

impl std::fmt::Debug for GpgHomeHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpgHomeHook")
            .field("key_file", &self.key_file)
            .field("key_flag", &self.key_flag)
            .field("gpg", &self.gpg)
            .field("home", &self.home_dir())
            .finish_non_exhaustive()
    }
}

impl GpgHomeHook {
    /// Import `key_file` with the `gpg` found on `PATH`.
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
            key_flag: DEFAULT_KEY_FLAG.to_string(),
            gpg: vec!["gpg".to_string()],
            home: Mutex::new(None),
        }
    }

    /// Override the flag preceding the fingerprint.
    #[must_use]
    pub fn with_key_flag(mut self, flag: impl Into<String>) -> Self {
        self.key_flag = flag.into();
        self
    }

    /// Override the gpg invocation: program followed by leading arguments.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `command` is empty.
    pub fn with_gpg_command(mut self, command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::Config("gpg command must not be empty".to_string()));
        }
        self.gpg = command;
        Ok(self)
    }

    /// Temporary home while set up.
    #[must_use]
    pub fn home_dir(&self) -> Option<PathBuf> {
        self.home.lock().as_ref().map(|h| h.dir.path().to_path_buf())
    }

    /// Fingerprint of the imported key while set up.
    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        self.home.lock().as_ref().map(|h| h.fingerprint.clone())
    }

    async fn gpg(&self, ctx: &Context, home: &Path, args: &[&str]) -> Result<Vec<u8>> {
        let (program, leading) = self
            .gpg
            .split_first()
            .ok_or_else(|| Error::Config("gpg command must not be empty".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg("--batch")
            .arg("--homedir")
            .arg(home)
            .args(args)
            .env("GNUPGHOME", home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = ctx.run(cmd.output()).await?.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to run '{program}': {e}"),
            ))
        })?;
        if !output.status.success() {
            return Err(Error::Internal(format!(
                "gpg {} failed ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// First secret key fingerprint in `gpg --with-colons --list-secret-keys`
/// output.
#[must_use]
pub fn parse_secret_fingerprint(colons: &str) -> Option<String> {
    let mut in_secret_key = false;
    for line in colons.lines() {
        let mut fields = line.split(':');
        match fields.next() {
            Some("sec") => in_secret_key = true,
            Some("ssb" | "pub" | "sub") => in_secret_key = false,
            Some("fpr") if in_secret_key => {
                // Field 10 holds the fingerprint.
                return fields
                    .nth(8)
                    .filter(|fpr| !fpr.is_empty())
                    .map(str::to_string);
            }
            _ => {}
        }
    }
    None
}

impl Hook for GpgHomeHook {
    fn name(&self) -> &str {
        GPG_HOOK_NAME
    }

    fn as_setup(&self) -> Option<&dyn SetupHook> {
        Some(self)
    }

    fn as_pre_command(&self) -> Option<&dyn PreCommandHook> {
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
impl SetupHook for GpgHomeHook {
    async fn setup(&self, ctx: &Context) -> Result<()> {
        if self.home_dir().is_some() {
            return Ok(());
        }

        // TempDir is created 0700 and removed on drop if setup bails out.
        let dir = tempfile::Builder::new().prefix("hookrun-gnupg-").tempdir()?;
        let key_file = self.key_file.to_string_lossy();
        self.gpg(ctx, dir.path(), &["--import", key_file.as_ref()])
            .await?;

        let listing = self
            .gpg(ctx, dir.path(), &["--with-colons", "--list-secret-keys"])
            .await?;
        let fingerprint = parse_secret_fingerprint(&String::from_utf8_lossy(&listing))
            .ok_or_else(|| {
                Error::Config(format!(
                    "No secret key found in '{}'",
                    self.key_file.display()
                ))
            })?;

        info!(home = %dir.path().display(), %fingerprint, "Imported GPG signing key");
        *self.home.lock() = Some(GpgHome { dir, fingerprint });
        Ok(())
    }
}

#[async_trait]
impl PreCommandHook for GpgHomeHook {
    async fn pre_command(
        &self,
        _ctx: &Context,
        _program: &mut String,
        args: &mut Vec<String>,
    ) -> Result<()> {
        let fingerprint = self
            .fingerprint()
            .ok_or_else(|| Error::Internal("GPG home is not set up".to_string()))?;
        args.splice(0..0, [self.key_flag.clone(), fingerprint]);
        Ok(())
    }
}

#[async_trait]
impl CommandHook for GpgHomeHook {
    async fn command(&self, _ctx: &Context, process: &mut ProcessSpec) -> Result<()> {
        let home = self
            .home_dir()
            .ok_or_else(|| Error::Internal("GPG home is not set up".to_string()))?;
        process.set_env("GNUPGHOME", home.to_string_lossy());
        Ok(())
    }
}

#[async_trait]
impl CleanupHook for GpgHomeHook {
    async fn cleanup(&self, _ctx: &Context) -> Result<()> {
        let Some(home) = self.home.lock().take() else {
            return Ok(());
        };
        let path = home.dir.path().to_path_buf();
        home.dir.close().map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to remove GPG home '{}': {e}", path.display()),
            ))
        })?;
        debug!(home = %path.display(), "Removed GPG home");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const LISTING: &str = "\
sec:u:255:22:7D3B6A1F0C2E9B44:1700000000:::u:::scESC:::+:::ed25519:::0:
fpr:::::::::4B1F9E0C2A7D3B6A1F0C2E9B447D3B6A1F0C2E9B:
grp:::::::::0A1B2C3D4E5F60718293A4B5C6D7E8F901234567:
uid:u::::1700000000::ABCDEF::Release Signing <release@example.com>::::::::::0:
ssb:u:255:18:1122334455667788:1700000000::::::e:::+:::cv25519::
fpr:::::::::99999999999999999999999999999999999999AA:
";

    /// A stand-in for gpg that accepts `--import` and prints `LISTING`.
    fn fake_gpg(dir: &Path) -> Vec<String> {
        let script = dir.join("fake-gpg.sh");
        let body = format!(
            "for a in \"$@\"; do\n  case \"$a\" in\n    --import) exit 0 ;;\n    \
             --list-secret-keys) printf '%s' '{LISTING}'; exit 0 ;;\n  esac\ndone\nexit 2\n"
        );
        std::fs::write(&script, body).unwrap();
        vec!["sh".to_string(), script.display().to_string()]
    }

    #[test]
    fn parses_primary_secret_key_fingerprint() {
        assert_eq!(
            parse_secret_fingerprint(LISTING).as_deref(),
            Some("4B1F9E0C2A7D3B6A1F0C2E9B447D3B6A1F0C2E9B")
        );
    }

    #[test]
    fn no_secret_key_means_no_fingerprint() {
        let public_only = "pub:u:255:22:AA:1700000000:::u:::scESC::::::23::0:\n\
                           fpr:::::::::AAAA:\n";
        assert_eq!(parse_secret_fingerprint(public_only), None);
        assert_eq!(parse_secret_fingerprint(""), None);
    }

    #[test]
    fn empty_gpg_command_is_rejected() {
        assert!(GpgHomeHook::new("key.asc").with_gpg_command(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn lifecycle_creates_uses_and_removes_home() {
        let scratch = tempfile::tempdir().unwrap();
        let hook = GpgHomeHook::new(scratch.path().join("key.asc"))
            .with_key_flag("--signing-key")
            .with_gpg_command(fake_gpg(scratch.path()))
            .unwrap();
        let ctx = Context::background();

        hook.setup(&ctx).await.unwrap();
        let home = hook.home_dir().unwrap();
        assert!(home.is_dir());

        let mut program = "attune".to_string();
        let mut args = vec!["repo".to_string(), "sync".to_string()];
        hook.pre_command(&ctx, &mut program, &mut args).await.unwrap();
        assert_eq!(
            args,
            vec![
                "--signing-key",
                "4B1F9E0C2A7D3B6A1F0C2E9B447D3B6A1F0C2E9B",
                "repo",
                "sync"
            ]
        );

        let mut process = ProcessSpec::new(program, args);
        hook.command(&ctx, &mut process).await.unwrap();
        assert_eq!(process.env["GNUPGHOME"], home.to_string_lossy());

        hook.cleanup(&ctx).await.unwrap();
        assert!(!home.exists());
        assert!(hook.home_dir().is_none());
    }

    #[tokio::test]
    async fn failing_import_leaves_no_home_behind() {
        let hook = GpgHomeHook::new("/nonexistent/key.asc")
            .with_gpg_command(vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()])
            .unwrap();

        let err = hook.setup(&Context::background()).await.unwrap_err();
        assert!(err.to_string().contains("--import"));
        assert!(hook.home_dir().is_none());
    }

    #[tokio::test]
    async fn pre_command_without_setup_fails() {
        let hook = GpgHomeHook::new("key.asc");
        let mut program = "attune".to_string();
        let mut args = Vec::new();
        assert!(
            hook.pre_command(&Context::background(), &mut program, &mut args)
                .await
                .is_err()
        );
        assert!(args.is_empty());
    }
}
