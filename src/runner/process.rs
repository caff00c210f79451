//! The process a runner is about to start.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

/// Program, arguments and environment of one command invocation.
///
/// Command hooks receive this mutably; whatever it holds when the last hook
/// returns is what gets executed. The parent's environment is inherited and
/// `env` entries override it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable name or path, looked up on `PATH`.
    pub program: String,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Environment overrides.
    pub env: BTreeMap<String, String>,
    /// Working directory; the parent's when unset.
    pub current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    /// `program` with `args`, no extra environment.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }

    /// Set an environment variable for the child.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Shell-quoted rendering with environment overrides prefixed, e.g.
    /// `GNUPGHOME=/tmp/x attune repo sync --key-id 'A B'`.
    ///
    /// Variables are sorted, so repeated invocations render identically.
    #[must_use]
    pub fn render(&self) -> String {
        self.env
            .iter()
            .map(|(key, value)| format!("{key}={}", quote(value)))
            .chain(std::iter::once(quote(&self.program).into_owned()))
            .chain(self.args.iter().map(|arg| quote(arg).into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build the child process with inherited stdio.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

fn quote(s: &str) -> Cow<'_, str> {
    // Strings with NUL cannot be quoted; they also cannot be passed to exec.
    shlex::try_quote(s).unwrap_or(Cow::Borrowed(s))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn render_prefixes_sorted_env_and_quotes() {
        let mut spec = ProcessSpec::new(
            "attune",
            vec!["repo".into(), "sync".into(), "two words".into()],
        );
        spec.set_env("ZED", "last").set_env("ATTUNE_API_ENDPOINT", "http://127.0.0.1:4000");

        assert_eq!(
            spec.render(),
            "ATTUNE_API_ENDPOINT=http://127.0.0.1:4000 ZED=last attune repo sync 'two words'"
        );
    }

    #[test]
    fn render_without_env_is_plain_command_line() {
        let spec = ProcessSpec::new("true", Vec::new());
        assert_eq!(spec.render(), "true");
    }

    #[test]
    fn empty_argument_is_visible() {
        let spec = ProcessSpec::new("echo", vec![String::new()]);
        assert_eq!(spec.render(), "echo ''");
    }
}
