//! OAuth discovery documents served by the broker.
//!
//! Implements RFC 8414 (Authorization Server Metadata) and RFC 9728
//! (Protected Resource Metadata).

use serde::{Deserialize, Serialize};

use super::broker::PKCE_METHOD;
use super::clients::SUPPORTED_GRANT_TYPES;
use crate::config::BrokerConfig;

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint
    pub registration_endpoint: String,

    /// Supported response types
    pub response_types_supported: Vec<String>,

    /// Supported grant types
    pub grant_types_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    pub code_challenge_methods_supported: Vec<String>,

    /// Token endpoint client authentication (public clients only)
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported scopes
    pub scopes_supported: Vec<String>,
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    pub authorization_servers: Vec<String>,

    /// Supported bearer token methods
    pub bearer_methods_supported: Vec<String>,

    /// Supported scopes
    pub scopes_supported: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

impl AuthorizationServerMetadata {
    /// Metadata describing this broker.
    #[must_use]
    pub fn for_broker(config: &BrokerConfig) -> Self {
        let origin = config.origin();
        Self {
            issuer: origin.to_string(),
            authorization_endpoint: format!("{origin}/oauth/authorize"),
            token_endpoint: format!("{origin}/oauth/token"),
            registration_endpoint: format!("{origin}/oauth/register"),
            response_types_supported: strings(&["code"]),
            grant_types_supported: strings(&SUPPORTED_GRANT_TYPES),
            code_challenge_methods_supported: strings(&[PKCE_METHOD]),
            token_endpoint_auth_methods_supported: strings(&["none"]),
            scopes_supported: config.scopes_supported.clone(),
        }
    }
}

impl ProtectedResourceMetadata {
    /// Metadata for the resource server this broker guards.
    #[must_use]
    pub fn for_broker(config: &BrokerConfig) -> Self {
        let origin = config.origin().to_string();
        Self {
            resource: origin.clone(),
            authorization_servers: vec![origin],
            bearer_methods_supported: strings(&["header"]),
            scopes_supported: config.scopes_supported.clone(),
        }
    }
}
