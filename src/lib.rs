use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod db;
pub mod guards;
pub mod handlers;
pub mod jobs;
pub mod links;
pub mod models;
pub mod resolver;
pub mod safety;
pub mod store;

#[cfg(test)]
mod testing;

use guards::{GuardChain, Throttle, TrafficAnomalyGuard};
use jobs::{ExpirySweeper, PeriodicJob, StatsAggregator};
use links::LinkService;
use resolver::Resolver;
use safety::FailOpen;
use store::SharedStore;

// ── Shared application state ───────────────────────────────────────────────

pub struct AppState {
    pub config: config::AppConfig,
    pub db: sqlx::SqlitePool,
    /// Already bounded by the configured store timeout.
    pub store: SharedStore,
    pub store_kind: &'static str,
    pub resolver: Resolver,
    pub guards: GuardChain,
    /// Mutations for the owner and administrator surfaces.
    pub links: LinkService,
    /// Stats flush first, then the expiry sweep.
    pub jobs: Vec<PeriodicJob>,
}

impl AppState {
    /// Wire the resolver, the redirect route's defense chain, and the two
    /// reconciliation jobs around one ephemeral store. Jobs are created
    /// stopped.
    pub fn build(config: config::AppConfig, db: sqlx::SqlitePool, store: SharedStore) -> Self {
        let timeout = config.store_timeout;

        let guards = GuardChain::new()
            .with(Throttle::global_ip(store.clone(), config.global_ip_limit))
            .with(Throttle::link_ip(store.clone(), config.link_ip_limit))
            .with(Throttle::fixed_window(
                store.clone(),
                config.rate_limit_prefix.clone(),
                config.rate_limit_max,
                config.rate_limit_window,
            ))
            .with(TrafficAnomalyGuard::new(store.clone(), db.clone(), timeout));

        let jobs = vec![
            PeriodicJob::new(
                StatsAggregator::new(store.clone(), db.clone(), timeout),
                config.flush_interval,
            ),
            PeriodicJob::new(
                ExpirySweeper::new(store.clone(), db.clone(), timeout),
                config.sweep_interval,
            ),
        ];

        let safety = FailOpen::from_config(
            config.safe_browsing_api_key.as_deref(),
            config.safety_timeout,
        );
        let links = LinkService::new(db.clone(), store.clone(), safety, timeout);

        Self {
            store_kind: if config.redis_url.is_some() {
                "redis"
            } else {
                "memory"
            },
            resolver: Resolver::new(store.clone(), db.clone(), timeout),
            guards,
            links,
            jobs,
            config,
            db,
            store,
        }
    }
}

// ── Router ─────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        // Short-link redirect; static routes above take priority
        .route("/:code", get(handlers::redirect::redirect))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
