//! HTTP router and shared state

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, keys, metadata};
use crate::api_keys::ApiKeyStore;
use crate::auth::{BearerGuard, BearerResolver, require_bearer};
use crate::config::BrokerConfig;
use crate::oauth::{IdentityProvider, OAuthBroker};
use crate::store::KvStore;

/// Shared application state
pub struct AppState {
    /// OAuth broker (owns the client registry and key store handles)
    pub broker: OAuthBroker,
    /// Bearer authentication for the key management routes
    pub guard: Arc<BearerGuard>,
    /// Broker settings (public origin, advertised scopes)
    pub broker_config: BrokerConfig,
}

impl AppState {
    /// Wire every component over one store and one IdP.
    #[must_use]
    pub fn new(
        store: Arc<dyn KvStore>,
        idp: Arc<dyn IdentityProvider>,
        broker_config: BrokerConfig,
    ) -> Self {
        let broker = OAuthBroker::new(Arc::clone(&store), Arc::clone(&idp), &broker_config);
        let resolver = BearerResolver::new(ApiKeyStore::new(store), idp);
        let guard = Arc::new(BearerGuard::new(
            resolver,
            &broker_config.resource_metadata_url(),
        ));
        Self {
            broker,
            guard,
            broker_config,
        }
    }

    /// Key store shared by the broker and the key management routes.
    #[must_use]
    pub fn keys(&self) -> &ApiKeyStore {
        self.broker.keys()
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    let guard = Arc::clone(&state.guard);

    let protected = Router::new()
        .route(
            "/api/token",
            get(keys::list_keys)
                .post(keys::create_key)
                .delete(keys::revoke_key),
        )
        .route("/api/tokens", delete(keys::revoke_all_keys))
        .route_layer(middleware::from_fn_with_state(guard, require_bearer));

    Router::new()
        .route("/health", get(metadata::health))
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata::authorization_server),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(metadata::protected_resource),
        )
        .route("/oauth/authorize", get(handlers::authorize))
        .route("/oauth/callback", get(handlers::callback))
        .route("/oauth/token", post(handlers::token))
        .route("/oauth/register", post(handlers::register))
        .merge(protected)
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
