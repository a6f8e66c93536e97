use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};

use super::{Job, JobOutcome};
use crate::{
    db,
    store::{bounded, keys, SharedStore, StoreError},
};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Moves links past their expiry to `expired` and evicts their cached
/// snapshots, so an expired link stops resolving from either store without
/// waiting out the cache TTL.
pub struct ExpirySweeper {
    store: SharedStore,
    db: SqlitePool,
    db_timeout: Duration,
}

impl ExpirySweeper {
    pub fn new(store: SharedStore, db: SqlitePool, db_timeout: Duration) -> Self {
        Self {
            store,
            db,
            db_timeout,
        }
    }

    /// Returns how many links were expired by this sweep.
    pub async fn sweep_expired(&self) -> Result<u64, StoreError> {
        let codes = bounded(self.db_timeout, db::expire_links(&self.db, Utc::now())).await?;
        if codes.is_empty() {
            return Ok(0);
        }
        info!("Expired {} link(s)", codes.len());

        // The rows are committed; a failed eviction only leaves snapshots the
        // resolver already rejects by their expiry time.
        let cache_keys: Vec<String> = codes.iter().map(|code| keys::url(code)).collect();
        if let Err(e) = self.store.delete(&cache_keys).await {
            warn!("Could not evict {} expired snapshot(s): {}", cache_keys.len(), e);
        }
        Ok(codes.len() as u64)
    }
}

#[async_trait]
impl Job for ExpirySweeper {
    fn name(&self) -> &'static str {
        "expiry-sweep"
    }

    async fn run(&self) -> anyhow::Result<JobOutcome> {
        let expired = self.sweep_expired().await?;
        Ok(JobOutcome {
            processed: expired,
            failed: 0,
        })
    }
}
