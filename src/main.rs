use std::{net::SocketAddr, sync::Arc};

use linkguard::{
    config, db, router,
    store::{MemoryStore, RedisStore, SharedStore, TimeoutStore},
    AppState,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present; env vars may already be set
    dotenvy::dotenv().ok();

    // Initialise structured logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linkguard=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = config::AppConfig::from_env()?;
    tracing::info!("Starting linkguard on {}:{}", config.host, config.port);

    let db = db::connect(&config.database_url).await?;

    // Ephemeral store: Redis when configured, otherwise in-process
    let backend: SharedStore = match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url).await?;
            tracing::info!("Ephemeral store: redis");
            Arc::new(store)
        }
        None => {
            tracing::warn!("REDIS_URL not set; counters and cache are local to this process");
            Arc::new(MemoryStore::new())
        }
    };
    let store: SharedStore = Arc::new(TimeoutStore::new(backend, config.store_timeout));

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::build(config, db, store));

    for job in &state.jobs {
        job.start();
    }

    // ── Serve ──────────────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // ── Shutdown ───────────────────────────────────────────────────────────
    for job in &state.jobs {
        job.stop().await;
    }
    // One last flush so pending clicks are not left in a process-local store.
    if let Some(flush) = state.jobs.first() {
        if let Err(e) = flush.run_once().await {
            tracing::error!("Final stats flush failed: {:#}", e);
        }
    }
    state.db.close().await;
    tracing::info!("Shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
