//! Control-plane service - main entry point.

use control_plane_service::{build_router, config::ServiceConfig, db, services, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration first (before tracing init)
    let config = ServiceConfig::from_env()?;

    service_core::observability::init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting control-plane-service"
    );

    // Create PostgreSQL connection pool and run migrations
    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;
    let database = services::Database::new(pool);

    // Create Redis-backed cache & deny layer
    let cache = Arc::new(services::RedisService::new(&config.redis).await?)
        as Arc<dyn services::CacheLayer>;
    tracing::info!("Redis connection established");

    // Create IdP client
    let idp =
        Arc::new(services::IdpClient::new(&config.idp)?) as Arc<dyn services::IdentityProvider>;
    tracing::info!(base_url = %config.idp.base_url, "IdP client initialized");

    let port = config.common.port;
    let state = AppState::new(config, database, cache, idp);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("HTTP server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
