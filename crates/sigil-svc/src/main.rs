//! Sigil wallet hub service binary

use anyhow::Result;
use clap::Parser;
use sigil_svc::auth::{AuthProvider, StaticAuth, WebhookAuth};
use sigil_svc::vault::{MemoryStore, Vault};
use sigil_svc::{router, AppState, ServiceConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

/// Threshold-ECDSA wallet hub
#[derive(Parser, Debug)]
#[command(name = "sigil-svc")]
#[command(about = "Threshold signing hub for sigil wallets")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(short, long, env = "SIGIL_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Auth webhook URL; the bearer token is forwarded and a 200 body is
    /// taken as the user id
    #[arg(long, env = "SIGIL_AUTH_URL")]
    auth_url: Option<String>,

    /// Development fallback: accept this single bearer as user "dev"
    #[arg(long, env = "SIGIL_DEV_BEARER")]
    dev_bearer: Option<String>,

    /// Access-token lifetime in seconds
    #[arg(long, env = "SIGIL_TOKEN_TTL", default_value = "120")]
    token_ttl: u64,

    /// Ceremony session deadline in seconds
    #[arg(long, env = "SIGIL_SESSION_DEADLINE", default_value = "60")]
    session_deadline: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let auth: Arc<dyn AuthProvider> = match (&args.auth_url, &args.dev_bearer) {
        (Some(url), _) => Arc::new(WebhookAuth::new(url)),
        (None, Some(bearer)) => {
            info!("no auth webhook configured, using the development bearer");
            Arc::new(StaticAuth::new([(bearer.as_str(), "dev")]))
        }
        (None, None) => {
            anyhow::bail!("either --auth-url or --dev-bearer must be configured")
        }
    };

    let config = ServiceConfig {
        session_deadline: Duration::from_secs(args.session_deadline),
        token_ttl: Duration::from_secs(args.token_ttl),
    };

    let state = AppState::new(Vault::new(MemoryStore::new()), auth, config);
    state.tokens.spawn_sweeper();

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
