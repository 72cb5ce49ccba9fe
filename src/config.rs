//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Environment variable prefix. Nested keys use `__`, e.g.
/// `KARTPARK_AUTH_IDP__CLIENT_ID`.
pub const ENV_PREFIX: &str = "KARTPARK_AUTH_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before the IdP secret is resolved.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// OAuth broker configuration
    pub broker: BrokerConfig,
    /// External identity provider
    pub idp: IdpConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        Ok(config)
    }

    /// Check the values a running broker depends on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let base = Url::parse(&self.broker.base_url)
            .map_err(|e| Error::Config(format!("broker.base_url: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config("broker.base_url must be an http(s) origin".into()));
        }

        for (name, value) in [
            ("idp.authorize_endpoint", &self.idp.authorize_endpoint),
            ("idp.token_endpoint", &self.idp.token_endpoint),
            ("idp.userinfo_endpoint", &self.idp.userinfo_endpoint),
        ] {
            Url::parse(value).map_err(|e| Error::Config(format!("{name}: {e}")))?;
        }

        if self.idp.client_id.is_empty() {
            return Err(Error::Config("idp.client_id is required".into()));
        }
        if self.broker.session_ttl.is_zero() || self.broker.code_ttl.is_zero() {
            return Err(Error::Config("broker TTLs must be non-zero".into()));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), env::var("HOME")) {
                (Some(rest), Ok(home)) => format!("{home}{rest}"),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// OAuth broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Public origin of this service. The IdP callback and metadata URLs
    /// are derived from it.
    pub base_url: String,
    /// How long an authorization session survives between authorize and callback
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    /// How long a minted authorization code stays redeemable
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
    /// Scopes advertised in metadata
    pub scopes_supported: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            session_ttl: Duration::from_secs(600),
            code_ttl: Duration::from_secs(300),
            scopes_supported: default_scopes(),
        }
    }
}

impl BrokerConfig {
    /// `base_url` without a trailing slash.
    #[must_use]
    pub fn origin(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Where the IdP sends the user agent back to.
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("{}/oauth/callback", self.origin())
    }

    /// RFC 9728 protected-resource metadata URL.
    #[must_use]
    pub fn resource_metadata_url(&self) -> String {
        format!("{}/.well-known/oauth-protected-resource", self.origin())
    }
}

/// External identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// Browser-facing authorize endpoint
    pub authorize_endpoint: String,
    /// Server-to-server token endpoint
    pub token_endpoint: String,
    /// Server-to-server userinfo endpoint
    pub userinfo_endpoint: String,
    /// Client id registered with the IdP
    pub client_id: String,
    /// Client secret (supports `env:VAR_NAME`). Public IdP clients leave this unset.
    pub client_secret: Option<String>,
    /// Scopes requested from the IdP
    pub scopes: Vec<String>,
    /// Timeout for outbound IdP calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            authorize_endpoint: String::new(),
            token_endpoint: String::new(),
            userinfo_endpoint: String::new(),
            client_id: String::new(),
            client_secret: None,
            scopes: default_scopes(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl IdpConfig {
    /// Resolve the client secret (expand `env:VAR`). Empty values count as unset.
    #[must_use]
    pub fn resolved_client_secret(&self) -> Option<String> {
        let raw = self.client_secret.as_ref()?;
        let value = match raw.strip_prefix("env:") {
            Some(var_name) => env::var(var_name).ok()?,
            None => raw.clone(),
        };
        (!value.is_empty()).then_some(value)
    }
}

fn default_scopes() -> Vec<String> {
    ["openid", "email", "profile"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

/// Serde helpers for human-readable durations (`"30s"`, `"10m"`, `"250ms"`, or bare seconds)
pub mod humantime_serde {
    use std::fmt;
    use std::time::Duration;

    use serde::{
        Deserializer, Serializer,
        de::{self, Visitor},
    };

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a duration from a string with unit suffix or an integer
    /// number of seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration such as \"30s\", \"10m\", \"250ms\" or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, s: &str) -> Result<Duration, E> {
            parse(s).map_err(E::custom)
        }
    }

    /// Parse `"250ms"`, `"30s"`, `"10m"`, `"1h"` or a bare number of seconds.
    ///
    /// # Errors
    ///
    /// Returns a message describing the malformed input.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |n: &str| n.trim().parse::<u64>().map_err(|e| format!("{s:?}: {e}"));

        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            number(hours).map(|h| Duration::from_secs(h * 3600))
        } else {
            number(s).map(Duration::from_secs)
        }
    }
}
