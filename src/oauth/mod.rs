//! OAuth 2.0 authorization broker
//!
//! Implements the Authorization Code flow with PKCE (RFC 7636) for
//! third-party clients, federating user login to an external IdP.
//!
//! Features:
//! - Dynamic client registration (RFC 7591)
//! - Short-lived authorization sessions and one-time codes with native TTLs
//! - Refresh through the IdP
//! - Discovery metadata (RFC 8414, RFC 9728)

pub mod broker;
pub mod clients;
pub mod codes;
pub mod idp;
pub mod metadata;
pub mod sessions;

pub use broker::{
    AuthorizeParams, CallbackParams, CodeExchange, OAuthBroker, RefreshRequest, TokenRequest,
    TokenResponse,
};
pub use clients::{ClientRegistry, OAuthClient, RegistrationRequest};
pub use idp::{HttpIdentityProvider, IdentityProvider, IdpError, UpstreamTokens, UserIdentity};
pub use metadata::{AuthorizationServerMetadata, ProtectedResourceMetadata};
