//! HTTP surface of the auth broker

pub mod handlers;
pub mod keys;
pub mod metadata;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

pub use router::{AppState, create_router};

use crate::config::Config;
use crate::oauth::{HttpIdentityProvider, IdentityProvider};
use crate::store::{InMemoryStore, KvStore};
use crate::{Error, Result};

/// Auth broker server
pub struct Server {
    config: Config,
    store: Arc<dyn KvStore>,
    idp: Arc<dyn IdentityProvider>,
}

impl Server {
    /// Build a server from configuration, with the in-memory store and the
    /// HTTP identity provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is incomplete or an
    /// IdP endpoint is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let idp = HttpIdentityProvider::from_config(&config.idp)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self::with_components(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(idp),
        ))
    }

    /// Build a server around explicit store and IdP implementations.
    #[must_use]
    pub fn with_components(
        config: Config,
        store: Arc<dyn KvStore>,
        idp: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self { config, store, idp }
    }

    /// Run until Ctrl+C / SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid, the port cannot be
    /// bound, or the server fails while running.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Arc::new(AppState::new(
            self.store,
            self.idp,
            self.config.broker.clone(),
        ));
        let app = create_router(state, self.config.server.request_timeout);

        let listener = TcpListener::bind(addr).await?;

        let origin = self.config.broker.origin();
        info!("============================================================");
        info!("KARTPARK AUTH v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(public_origin = %origin, idp_client = %self.config.idp.client_id, "OAuth broker");
        info!("  GET  {origin}/oauth/authorize");
        info!("  POST {origin}/oauth/token");
        info!("  POST {origin}/oauth/register");
        info!("  GET  {origin}/.well-known/oauth-authorization-server");
        warn!("Using the in-memory store; keys and clients are lost on restart");
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Server stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
