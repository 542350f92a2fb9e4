//! # sigil-svc
//!
//! The wallet hub: an axum service that mediates every ceremony between
//! itself and the enrolled devices over WebSockets, keeps the server-side
//! share sealed under client-held custody keys, and exposes the
//! authentication and recovery surface.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod registry;
mod session;
pub mod vault;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use auth::AuthProvider;
use registry::{AddShareRegistry, TokenCache};
use vault::Vault;

pub use error::{Result, SvcError};

/// Tunables of one service instance
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Hard deadline for every ceremony session
    pub session_deadline: Duration,
    /// Lifetime of minted access tokens
    pub token_ttl: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            session_deadline: Duration::from_secs(60),
            token_ttl: Duration::from_secs(120),
        }
    }
}

/// Shared state of the hub
#[derive(Clone)]
pub struct AppState {
    pub vault: Arc<Vault>,
    pub tokens: Arc<TokenCache>,
    pub rendezvous: Arc<AddShareRegistry>,
    pub auth: Arc<dyn AuthProvider>,
    pub config: Arc<ServiceConfig>,
}

impl AppState {
    pub fn new(
        vault: Arc<Vault>,
        auth: Arc<dyn AuthProvider>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            vault,
            tokens: TokenCache::new(config.token_ttl),
            rendezvous: AddShareRegistry::new(),
            auth,
            config: Arc::new(config),
        }
    }
}

/// Build the hub router: the authentication surface plus one endpoint per
/// ceremony.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/identify", get(handlers::identify))
        .route("/authorize", get(handlers::authorize))
        .route("/dkg", get(handlers::dkg::handler))
        .route("/sign", get(handlers::sign::handler))
        .route("/register", get(handlers::add::register))
        .route("/accept", get(handlers::add::accept))
        .route("/recover", post(handlers::recover::handler))
        .layer(axum::middleware::from_fn(auth::custody_headers))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
