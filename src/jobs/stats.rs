use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Job, JobOutcome};
use crate::{
    db,
    store::{bounded, keys, SharedStore, StoreError},
};

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(300);

const SCAN_PAGE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Codes whose deltas reached the database.
    pub applied: u64,
    /// Codes with pending stats but no row; their stats are dropped.
    pub orphaned: u64,
    /// Codes left in `stats-inflight:` for the next flush.
    pub failed: u64,
}

enum Drained {
    Applied,
    Empty,
    Orphaned,
}

/// Drains `stats:<code>` hashes into the durable click and abuse counters.
///
/// Each hash is claimed with one atomic read-and-clear into
/// `stats-inflight:<code>`, so increments racing the flush land in a fresh
/// `stats:` key instead of being deleted. The inflight key is removed only
/// after its delta is in the database; one that fails stays put and is
/// picked up again by the next flush, which makes aggregation at-least-once.
///
/// Only one aggregator may run against a given store at a time.
pub struct StatsAggregator {
    store: SharedStore,
    db: SqlitePool,
    db_timeout: Duration,
}

impl StatsAggregator {
    pub fn new(store: SharedStore, db: SqlitePool, db_timeout: Duration) -> Self {
        Self {
            store,
            db,
            db_timeout,
        }
    }

    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        let mut report = FlushReport::default();

        // Leftovers from failed flushes first, then fresh stats.
        for pattern in [keys::INFLIGHT_PATTERN, keys::STATS_PATTERN] {
            let mut cursor = 0;
            loop {
                let (next, page) = self.store.scan(cursor, pattern, SCAN_PAGE).await?;
                self.flush_page(&page, &mut report).await;
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }

        debug!("Stats flush finished: {:?}", report);
        Ok(report)
    }

    async fn flush_page(&self, page: &[String], report: &mut FlushReport) {
        let mut done = Vec::with_capacity(page.len());

        for key in page {
            let Some(code) = keys::code_from_stats_key(key) else {
                continue;
            };
            match self.drain(code).await {
                Ok(Drained::Applied) => {
                    report.applied += 1;
                    done.push(keys::stats_inflight(code));
                }
                Ok(Drained::Empty) => done.push(keys::stats_inflight(code)),
                Ok(Drained::Orphaned) => {
                    report.orphaned += 1;
                    debug!("Dropping stats for unknown code '{}'", code);
                    done.push(keys::stats_inflight(code));
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Stats for '{}' kept for the next flush: {}", code, e);
                }
            }
        }

        if done.is_empty() {
            return;
        }
        // A failed delete leaves applied deltas behind to be applied again:
        // a double count, never a lost one.
        if let Err(e) = self.store.delete(&done).await {
            warn!(
                "Could not clear {} drained stats key(s), they will be reapplied: {}",
                done.len(),
                e
            );
        }
    }

    async fn drain(&self, code: &str) -> Result<Drained, StoreError> {
        let claimed = self
            .store
            .claim_hash(&keys::stats(code), &keys::stats_inflight(code))
            .await?;
        let clicks = claimed.get(keys::CLICKS_FIELD).copied().unwrap_or(0);
        let abuse = claimed.get(keys::ABUSE_FIELD).copied().unwrap_or(0);
        if clicks == 0 && abuse == 0 {
            return Ok(Drained::Empty);
        }

        let found = bounded(
            self.db_timeout,
            db::apply_stats_delta(&self.db, code, clicks, abuse, Utc::now()),
        )
        .await?;
        Ok(if found {
            Drained::Applied
        } else {
            Drained::Orphaned
        })
    }
}

#[async_trait]
impl Job for StatsAggregator {
    fn name(&self) -> &'static str {
        "stats-flush"
    }

    async fn run(&self) -> anyhow::Result<JobOutcome> {
        let report = self.flush().await?;
        Ok(JobOutcome {
            processed: report.applied + report.orphaned,
            failed: report.failed,
        })
    }
}
