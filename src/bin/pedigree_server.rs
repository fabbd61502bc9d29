use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use pedigree_graph::api::{HasPool, PedigreeApp};
use pedigree_graph::config::ServerConfig;
use pedigree_graph::db;
use sqlx::SqlitePool;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct ServerApp {
    pool: Arc<SqlitePool>,
}

impl HasPool for ServerApp {
    fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }
}

impl PedigreeApp for ServerApp {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().context("failed to read server configuration")?;

    let pool = db::connect(&config.store)
        .await
        .context("failed to open pedigree store")?;
    db::create_pedigree_tables(&pool)
        .await
        .context("failed to run pedigree migrations")?;

    let app_state = ServerApp {
        pool: Arc::new(pool.clone()),
    };
    let app = Router::new()
        .nest("/api/v1", pedigree_graph::api::routes::<ServerApp>())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.bind))?;

    tracing::info!(bind = %config.bind, "pedigree server listening on /api/v1");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("pedigree server failed")?;

    pool.close().await;
    tracing::info!("pedigree store closed");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
