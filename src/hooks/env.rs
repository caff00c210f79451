//! Fixed environment variables.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::context::Context;
use crate::runner::{CommandHook, Hook, ProcessSpec};
use crate::{Error, Result};

/// Sets the same environment variables on every command.
#[derive(Debug, Clone)]
pub struct EnvHook {
    name: String,
    vars: BTreeMap<String, String>,
}

impl EnvHook {
    /// Hook called `name` setting `vars`.
    pub fn new<K, V>(name: impl Into<String>, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Build from `KEY=VALUE` strings as given on the command line.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an entry without `=` or with an empty key.
    pub fn from_assignments(name: impl Into<String>, assignments: &[String]) -> Result<Self> {
        let vars = assignments
            .iter()
            .map(|assignment| match assignment.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(Error::Config(format!(
                    "Invalid environment assignment '{assignment}', expected KEY=VALUE"
                ))),
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            name: name.into(),
            vars,
        })
    }

    /// The variables this hook sets.
    #[must_use]
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

impl Hook for EnvHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_command(&self) -> Option<&dyn CommandHook> {
        Some(self)
    }
}

#[async_trait]
impl CommandHook for EnvHook {
    async fn command(&self, _ctx: &Context, process: &mut ProcessSpec) -> Result<()> {
        for (key, value) in &self.vars {
            process.set_env(key, value);
        }
        Ok(())
    }
}
