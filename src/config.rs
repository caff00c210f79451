//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::hooks::{DEFAULT_ENDPOINT_ENV, gpg::DEFAULT_KEY_FLAG};
use crate::tls::DEFAULT_RENEW_BEFORE;
use crate::{Error, Result};

/// Prefix of environment variables overriding file settings, e.g.
/// `HOOKRUN_MTLS__HOST=attune.internal`.
pub const ENV_PREFIX: &str = "HOOKRUN_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order; variables already set
    /// in the process environment win.
    pub env_files: Vec<String>,
    /// mTLS tunnel for the wrapped CLI
    pub mtls: MtlsConfig,
    /// Temporary GPG home with an imported signing key
    pub gpg: GpgConfig,
}

/// mTLS proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtlsConfig {
    /// Start the proxy hook
    pub enabled: bool,
    /// Destination host, also used as TLS server name
    pub host: String,
    /// Destination port
    pub port: u16,
    /// PEM client certificate chain; re-read on every renewal
    pub client_cert: Option<String>,
    /// PEM private key matching `client_cert`
    pub client_key: Option<String>,
    /// Extra PEM CA bundles trusted in addition to the Mozilla roots
    pub ca_certs: Vec<String>,
    /// Renew the client certificate this long before it expires
    #[serde(with = "humantime_serde")]
    pub renew_before: Duration,
    /// Environment variable receiving `http://<proxy address>`
    pub endpoint_env: String,
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 443,
            client_cert: None,
            client_key: None,
            ca_certs: Vec::new(),
            renew_before: DEFAULT_RENEW_BEFORE,
            endpoint_env: DEFAULT_ENDPOINT_ENV.to_string(),
        }
    }
}

impl MtlsConfig {
    /// Client certificate and key paths, when both are configured.
    #[must_use]
    pub fn client_cert_paths(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => Some((expand_tilde(cert), expand_tilde(key))),
            _ => None,
        }
    }

    /// CA bundle paths with `~` expanded.
    #[must_use]
    pub fn ca_cert_paths(&self) -> Vec<PathBuf> {
        self.ca_certs.iter().map(|p| expand_tilde(p)).collect()
    }
}

/// GPG home configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpgConfig {
    /// Import a signing key into a temporary GPG home
    pub enabled: bool,
    /// Armored secret key to import
    pub key_file: Option<String>,
    /// Flag passed before the key fingerprint
    pub key_flag: String,
    /// gpg invocation, split like a shell would
    pub program: String,
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_file: None,
            key_flag: DEFAULT_KEY_FLAG.to_string(),
            program: "gpg".to_string(),
        }
    }
}

impl GpgConfig {
    /// Key file with `~` expanded.
    #[must_use]
    pub fn key_path(&self) -> Option<PathBuf> {
        self.key_file.as_deref().map(expand_tilde)
    }

    /// `program` split into words.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on unbalanced quotes or an empty command.
    pub fn command(&self) -> Result<Vec<String>> {
        match shlex::split(&self.program) {
            Some(words) if !words.is_empty() => Ok(words),
            _ => Err(Error::Config(format!(
                "Invalid gpg program '{}'",
                self.program
            ))),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed
    /// or describes an unusable setup.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (HOOKRUN_ prefix, __ for nesting)
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = expand_tilde(path_str);
            if path.exists() {
                match dotenvy::from_path(&path) {
                    Ok(()) => tracing::info!(path = %path.display(), "Loaded env file"),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to load env file");
                    }
                }
            } else {
                tracing::debug!(path = %path.display(), "Env file not found (skipped)");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in host and path values
    fn expand_env_vars(&mut self) -> Result<()> {
        // Pattern: ${VAR} or ${VAR:-default}
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(format!("env pattern: {e}")))?;

        self.mtls.host = expand_string(&re, &self.mtls.host);
        for value in [
            &mut self.mtls.client_cert,
            &mut self.mtls.client_key,
            &mut self.gpg.key_file,
        ]
        .into_iter()
        .flatten()
        {
            *value = expand_string(&re, value);
        }
        for ca in &mut self.mtls.ca_certs {
            *ca = expand_string(&re, ca);
        }
        Ok(())
    }

    /// Reject combinations that would only fail later, mid-run.
    fn validate(&self) -> Result<()> {
        if self.mtls.enabled {
            if self.mtls.host.is_empty() {
                return Err(Error::Config("mtls.host is required when mtls is enabled".into()));
            }
            if self.mtls.client_cert.is_some() != self.mtls.client_key.is_some() {
                return Err(Error::Config(
                    "mtls.client_cert and mtls.client_key must be set together".into(),
                ));
            }
            if self.mtls.endpoint_env.is_empty() {
                return Err(Error::Config("mtls.endpoint_env must not be empty".into()));
            }
        }
        if self.gpg.enabled {
            if self.gpg.key_file.is_none() {
                return Err(Error::Config("gpg.key_file is required when gpg is enabled".into()));
            }
            self.gpg.command()?;
        }
        Ok(())
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Replace a leading `~` with the home directory.
#[must_use]
pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            home.join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(path),
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "1h" or bare seconds.
    ///
    /// # Errors
    ///
    /// Returns a message naming the rejected input.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let (number, scale) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, Duration::from_millis(1))
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, Duration::from_secs(1))
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, Duration::from_secs(60))
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, Duration::from_secs(3600))
        } else {
            // Assume seconds
            (s, Duration::from_secs(1))
        };

        let n: u32 = number
            .trim()
            .parse()
            .map_err(|e| format!("invalid duration '{s}': {e}"))?;
        scale
            .checked_mul(n)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    }
}
