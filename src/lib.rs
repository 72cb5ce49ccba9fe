//! kartpark-auth
//!
//! Authentication and authorization broker for the kart club platform.
//!
//! # Features
//!
//! - **API keys**: long-lived bearer credentials stored only as SHA-256
//!   hashes, issued and revoked as atomic owner/lookup record pairs
//! - **OAuth 2.0 + PKCE broker**: third-party MCP clients authorize through
//!   the broker, which federates login to an external identity provider and
//!   answers with an API key
//! - **Bearer resolution**: API key first, IdP userinfo second
//! - **Discovery**: RFC 8414 / RFC 9728 metadata, RFC 7591 registration
//!
//! Records live behind the [`store::KvStore`] trait; [`store::InMemoryStore`]
//! ships for tests and single-node runs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api_keys;
pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod secrets;
pub mod server;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("tracing already initialised: {e}")))
}
