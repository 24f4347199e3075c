use std::sync::Arc;

use tracing::info;

use slope_server::config::ServerConfig;
use slope_server::{AppStateInner, router};
use slope_store::LocalStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slope=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let store = LocalStore::open(&config.db_path)?;
    info!("Opened store at {}", config.db_path.display());

    let state = Arc::new(AppStateInner {
        store,
        jwt_secret: config.jwt_secret.clone(),
    });
    let app = router(state);

    let addr = config.addr()?;
    info!("Slope server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
