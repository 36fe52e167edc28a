//! BMS auth server

use std::sync::Arc;

use anyhow::Context;
use bms_api::{
    auth::{AuthService, PgRefreshTokenStore, PgUserDirectory, SystemClock},
    routes::create_router,
    telemetry, AppState, Config,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; real deployments set the environment
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("Invalid configuration")?;
    telemetry::init(config.log_format);

    tracing::info!(
        bind_address = %config.bind_address,
        auth = ?config.auth,
        "Starting bms-auth v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = bms_shared::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    bms_shared::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let auth = AuthService::new(
        Arc::new(config.auth.clone()),
        Arc::new(PgUserDirectory::new(pool.clone())),
        Arc::new(PgRefreshTokenStore::new(pool.clone())),
        Arc::new(SystemClock),
    )
    .context("Invalid auth configuration")?;

    let config = Arc::new(config);
    let state = AppState::new(config.clone(), Some(pool), Arc::new(auth));
    let app = create_router(state);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
