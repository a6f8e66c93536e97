use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    db,
    models::CacheEntry,
    store::{bounded, keys, SharedStore, StoreError},
};

/// Lifetime of a `url:<code>` snapshot, and so the worst-case staleness of a
/// cached redirect.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Redirect(String),
    Invalid,
}

/// Cache-aside lookup of short codes.
///
/// Only servable links are ever cached. A cached snapshot that turns out to
/// be unservable is evicted and answered without touching the database.
#[derive(Clone)]
pub struct Resolver {
    cache: SharedStore,
    db: SqlitePool,
    db_timeout: Duration,
}

impl Resolver {
    pub fn new(cache: SharedStore, db: SqlitePool, db_timeout: Duration) -> Self {
        Self {
            cache,
            db,
            db_timeout,
        }
    }

    /// Resolve a short code to its destination. Any store fault fails closed
    /// to [`Resolution::Invalid`].
    pub async fn resolve(&self, short_code: &str) -> Resolution {
        match self.try_resolve(short_code, Utc::now()).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(
                    "Could not confirm validity of '{}', serving invalid: {}",
                    short_code, e
                );
                Resolution::Invalid
            }
        }
    }

    async fn try_resolve(
        &self,
        short_code: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution, StoreError> {
        let key = keys::url(short_code);

        // ── 1. Cache ───────────────────────────────────────────────────────
        if let Some(raw) = self.cache.get(&key).await? {
            match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) if entry.is_servable(now) => {
                    debug!("Cache hit for '{}'", short_code);
                    return Ok(Resolution::Redirect(entry.original_url));
                }
                Ok(_) => {
                    debug!("Cached snapshot of '{}' is no longer servable", short_code);
                    self.cache.delete(&[key]).await?;
                    return Ok(Resolution::Invalid);
                }
                Err(e) => {
                    warn!("Evicting undecodable cache entry '{}': {}", key, e);
                    self.cache.delete(&[key.clone()]).await?;
                }
            }
        }

        // ── 2. Database ────────────────────────────────────────────────────
        let link = bounded(self.db_timeout, db::get_link_by_code(&self.db, short_code)).await?;
        let Some(link) = link.filter(|link| link.is_servable(now)) else {
            return Ok(Resolution::Invalid);
        };

        // ── 3. Backfill ────────────────────────────────────────────────────
        let payload = serde_json::to_string(&link.to_cache_entry())?;
        self.cache.set_ex(&key, &payload, CACHE_TTL).await?;

        Ok(Resolution::Redirect(link.original_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::LinkStatus,
        store::{EphemeralStore, MemoryStore},
        testing::FailingStore,
    };
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    async fn setup() -> (MemoryStore, SqlitePool, Resolver) {
        let cache = MemoryStore::new();
        let pool = db::test_pool().await;
        let resolver = Resolver::new(Arc::new(cache.clone()), pool.clone(), Duration::from_secs(1));
        (cache, pool, resolver)
    }

    async fn cache_entry(cache: &MemoryStore, code: &str, entry: &CacheEntry) {
        cache
            .set_ex(&keys::url(code), &serde_json::to_string(entry).unwrap(), CACHE_TTL)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn miss_populates_cache_with_ttl() {
        let (cache, pool, resolver) = setup().await;
        db::seed(&pool, "abc123", None).await;

        assert_eq!(
            resolver.resolve("abc123").await,
            Resolution::Redirect("https://example.com/abc123".into())
        );

        let raw = cache.get("url:abc123").await.unwrap().unwrap();
        let entry: CacheEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.original_url, "https://example.com/abc123");
        assert!(entry.is_active);
        let ttl = cache.ttl("url:abc123").await.unwrap().unwrap();
        assert!(ttl <= CACHE_TTL && ttl > CACHE_TTL - Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unknown_code_is_invalid_and_not_cached() {
        let (cache, _pool, resolver) = setup().await;
        assert_eq!(resolver.resolve("nope").await, Resolution::Invalid);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cached_inactive_is_evicted_without_database_read() {
        let (cache, pool, resolver) = setup().await;
        // The database still says active; only the cache is consulted.
        db::seed(&pool, "abc123", None).await;
        cache_entry(
            &cache,
            "abc123",
            &CacheEntry {
                original_url: "https://example.com/abc123".into(),
                is_active: false,
                status: LinkStatus::Inactive,
                expires_at: None,
            },
        )
        .await;

        assert_eq!(resolver.resolve("abc123").await, Resolution::Invalid);
        assert_eq!(cache.get("url:abc123").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_positive_cache_past_expiry_is_invalid() {
        let (cache, _pool, resolver) = setup().await;
        cache_entry(
            &cache,
            "y",
            &CacheEntry {
                original_url: "https://example.com/y".into(),
                is_active: true,
                status: LinkStatus::Active,
                expires_at: Some(Utc::now() - ChronoDuration::seconds(1)),
            },
        )
        .await;

        assert_eq!(resolver.resolve("y").await, Resolution::Invalid);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn expiry_is_enforced_before_any_sweep() {
        let (cache, pool, resolver) = setup().await;
        db::seed(&pool, "y", Some(Utc::now() - ChronoDuration::seconds(1))).await;

        assert_eq!(resolver.resolve("y").await, Resolution::Invalid);
        assert!(cache.is_empty());

        let link = db::get_link_by_code(&pool, "y").await.unwrap().unwrap();
        assert!(link.is_active, "the resolver never writes the durable row");
    }

    #[tokio::test]
    async fn deleted_link_is_invalid() {
        let (cache, pool, resolver) = setup().await;
        db::seed(&pool, "gone", None).await;
        db::soft_delete(&pool, "gone", "admin-1", "admin", Utc::now())
            .await
            .unwrap();

        assert_eq!(resolver.resolve("gone").await, Resolution::Invalid);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn undecodable_entry_falls_back_to_database() {
        let (cache, pool, resolver) = setup().await;
        db::seed(&pool, "abc", None).await;
        cache
            .set_ex("url:abc", "not json", CACHE_TTL)
            .await
            .unwrap();

        assert_eq!(
            resolver.resolve("abc").await,
            Resolution::Redirect("https://example.com/abc".into())
        );
        let raw = cache.get("url:abc").await.unwrap().unwrap();
        assert!(serde_json::from_str::<CacheEntry>(&raw).is_ok());
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let pool = db::test_pool().await;
        db::seed(&pool, "abc", None).await;
        let resolver = Resolver::new(Arc::new(FailingStore), pool, Duration::from_secs(1));

        assert_eq!(resolver.resolve("abc").await, Resolution::Invalid);
    }
}
