use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, warn};
use woothee::parser::Parser;

use super::{Guard, RequestContext, Verdict};
use crate::{
    db,
    store::{bounded, keys, SharedStore, StoreError},
};

/// Substrings of a user agent that mark it as an automation client.
pub const BOT_TOKENS: [&str; 5] = ["curl", "python", "wget", "bot", "scraper"];

pub const BOT_PENALTY: i64 = 5;

pub const BURST_WINDOW: Duration = Duration::from_secs(10);
pub const BURST_LIMIT: i64 = 8;
pub const BURST_PENALTY: i64 = 10;

pub const SPIKE_WINDOW: Duration = Duration::from_secs(60);
pub const SPIKE_LIMIT: i64 = 200;
pub const SPIKE_PENALTY: i64 = 20;

/// Cumulative score above which a link is disabled by the system.
pub const AUTO_DISABLE_THRESHOLD: i64 = 100;

/// Scores suspicious traffic against the link it targets. Never denies: a
/// link that collects enough score is disabled instead, and from then on
/// the resolver answers 410.
///
/// The score goes straight to the database because auto-disable needs the
/// running total. Clicks only go to the `stats:<code>` hash and reach the
/// database through the stats flush.
pub struct TrafficAnomalyGuard {
    store: SharedStore,
    db: SqlitePool,
    db_timeout: Duration,
}

impl TrafficAnomalyGuard {
    pub fn new(store: SharedStore, db: SqlitePool, db_timeout: Duration) -> Self {
        Self {
            store,
            db,
            db_timeout,
        }
    }

    async fn penalize(&self, short_code: &str, amount: i64) -> Result<(), StoreError> {
        let total = bounded(
            self.db_timeout,
            db::add_abuse_score(&self.db, short_code, amount, Utc::now()),
        )
        .await?;
        match total {
            Some(total) => debug!("'{}' abuse score +{} = {}", short_code, amount, total),
            None => debug!("Scored unknown code '{}', nothing to record", short_code),
        }
        Ok(())
    }

    /// Disables the link if its stored score is over the threshold, however
    /// the score got there. A no-op UPDATE for links under it or already
    /// disabled.
    async fn enforce_threshold(&self, short_code: &str) -> Result<(), StoreError> {
        let disabled = bounded(
            self.db_timeout,
            db::auto_disable(&self.db, short_code, AUTO_DISABLE_THRESHOLD, Utc::now()),
        )
        .await?;
        if disabled {
            warn!(
                "Auto-disabled '{}' above abuse score {}",
                short_code, AUTO_DISABLE_THRESHOLD
            );
            self.store.delete(&[keys::url(short_code)]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Guard for TrafficAnomalyGuard {
    fn name(&self) -> &'static str {
        "traffic-anomaly"
    }

    async fn check(&self, ctx: &RequestContext) -> Result<Verdict, StoreError> {
        let mut score = 0;

        let user_agent = ctx.user_agent.as_deref();
        if looks_automated(user_agent) {
            score += BOT_PENALTY;
        } else if let Some(crawler) = user_agent.and_then(crawler_name) {
            debug!("'{}' fetched by {} (not scored)", ctx.short_code, crawler);
        }

        let burst = self
            .store
            .incr_window(&keys::burst(&ctx.short_code, &ctx.ip), BURST_WINDOW)
            .await?;
        if burst > BURST_LIMIT {
            score += BURST_PENALTY;
        }

        let spike = self
            .store
            .incr_window(&keys::spike(&ctx.short_code), SPIKE_WINDOW)
            .await?;
        if spike > SPIKE_LIMIT {
            score += SPIKE_PENALTY;
        }

        self.store
            .hincr(&keys::stats(&ctx.short_code), keys::CLICKS_FIELD, 1)
            .await?;

        if score > 0 {
            self.penalize(&ctx.short_code, score).await?;
        }
        self.enforce_threshold(&ctx.short_code).await?;
        Ok(Verdict::Allow)
    }
}

/// True when the user agent contains one of [`BOT_TOKENS`].
pub fn looks_automated(user_agent: Option<&str>) -> bool {
    let Some(ua) = user_agent.filter(|ua| !ua.is_empty()) else {
        return false;
    };
    let lowered = ua.to_ascii_lowercase();
    BOT_TOKENS.iter().any(|token| lowered.contains(token))
}

/// Name of a crawler woothee recognises, for logging only.
fn crawler_name(user_agent: &str) -> Option<String> {
    Parser::new()
        .parse(user_agent)
        .filter(|result| result.category == "crawler")
        .map(|result| result.name.to_owned())
}
