//! Link mutations used by the owner and administrator surfaces.
//!
//! Authorization is the caller's job. Every mutation here evicts the
//! `url:<code>` snapshot after the row changes, so the resolver never keeps
//! serving the old state for the rest of the cache TTL.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::info;

use crate::{
    db::{self, NewLink},
    models::ShortLink,
    safety::FailOpen,
    store::{bounded, keys, SharedStore, StoreError},
};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("URL rejected: {0}")]
    Unsafe(String),

    #[error("short code may only contain letters, numbers, and hyphens")]
    InvalidCode,

    #[error("short code '{0}' is already taken")]
    CodeTaken(String),

    #[error("could not find a free short code")]
    NoFreeCode,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct LinkService {
    db: SqlitePool,
    store: SharedStore,
    safety: FailOpen,
    db_timeout: Duration,
}

impl LinkService {
    pub fn new(db: SqlitePool, store: SharedStore, safety: FailOpen, db_timeout: Duration) -> Self {
        Self {
            db,
            store,
            safety,
            db_timeout,
        }
    }

    /// Create an active link after a safety scan. Without `custom_code` a
    /// random 7-character code is generated.
    pub async fn create(
        &self,
        original_url: &str,
        owner: Option<&str>,
        custom_code: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ShortLink, LinkError> {
        let verdict = self.safety.check(original_url).await;
        if !verdict.safe {
            return Err(LinkError::Unsafe(
                verdict.reason.unwrap_or_else(|| "unsafe URL".into()),
            ));
        }

        let link = match custom_code.map(str::trim).filter(|s| !s.is_empty()) {
            Some(code) => {
                if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                    return Err(LinkError::InvalidCode);
                }
                self.insert(code, original_url, owner, expires_at).await?
            }
            None => {
                self.insert_generated(original_url, owner, expires_at, random_code)
                    .await?
            }
        };
        self.evict(&link.short_code).await?;

        info!("Created '{}' -> {}", link.short_code, link.original_url);
        Ok(link)
    }

    pub async fn deactivate(&self, short_code: &str, by: &str, role: &str) -> Result<bool, StoreError> {
        let changed = bounded(
            self.db_timeout,
            db::deactivate(&self.db, short_code, by, role, Utc::now()),
        )
        .await?;
        self.evict(short_code).await?;
        Ok(changed)
    }

    pub async fn reactivate(&self, short_code: &str) -> Result<bool, StoreError> {
        let changed = bounded(
            self.db_timeout,
            db::reactivate(&self.db, short_code, Utc::now()),
        )
        .await?;
        self.evict(short_code).await?;
        Ok(changed)
    }

    pub async fn delete(&self, short_code: &str, by: &str, role: &str) -> Result<bool, StoreError> {
        let changed = bounded(
            self.db_timeout,
            db::soft_delete(&self.db, short_code, by, role, Utc::now()),
        )
        .await?;
        self.evict(short_code).await?;
        Ok(changed)
    }

    async fn evict(&self, short_code: &str) -> Result<(), StoreError> {
        self.store.delete(&[keys::url(short_code)]).await?;
        Ok(())
    }

    /// The UNIQUE constraint decides whether a code is free, so two
    /// concurrent creates of the same code cannot both succeed.
    async fn insert(
        &self,
        short_code: &str,
        original_url: &str,
        owner: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ShortLink, LinkError> {
        let new_link = NewLink {
            short_code,
            original_url,
            owner,
            expires_at,
        };
        match bounded(self.db_timeout, db::insert_link(&self.db, &new_link)).await {
            Ok(link) => Ok(link),
            Err(e) if is_unique_violation(&e) => Err(LinkError::CodeTaken(short_code.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    /// Tries 7-character codes, then longer ones, until an insert goes
    /// through.
    async fn insert_generated(
        &self,
        original_url: &str,
        owner: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
        mut next_code: impl FnMut(usize) -> String,
    ) -> Result<ShortLink, LinkError> {
        for attempt in 0..GENERATE_ATTEMPTS {
            let len = if attempt < 10 { 7 } else { 9 };
            let code = next_code(len);
            match self.insert(&code, original_url, owner, expires_at).await {
                Err(LinkError::CodeTaken(_)) => continue,
                result => return result,
            }
        }
        Err(LinkError::NoFreeCode)
    }
}

const GENERATE_ATTEMPTS: usize = 13;

fn is_unique_violation(err: &StoreError) -> bool {
    match err {
        StoreError::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}

fn random_code(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::LinkStatus,
        resolver::{Resolution, Resolver, CACHE_TTL},
        safety::{AllowAll, ScannerError, SafetyVerdict, UrlSafetyChecker},
        store::{EphemeralStore, MemoryStore},
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    struct BlockEverything;

    #[async_trait]
    impl UrlSafetyChecker for BlockEverything {
        async fn check(&self, _url: &str) -> Result<SafetyVerdict, ScannerError> {
            Ok(SafetyVerdict::unsafe_because("phishing"))
        }
    }

    async fn setup(checker: impl UrlSafetyChecker + 'static) -> (MemoryStore, SqlitePool, LinkService) {
        let store = MemoryStore::new();
        let pool = db::test_pool().await;
        let service = LinkService::new(
            pool.clone(),
            Arc::new(store.clone()),
            FailOpen::new(checker, Duration::from_secs(1)),
            Duration::from_secs(1),
        );
        (store, pool, service)
    }

    #[tokio::test]
    async fn create_generates_a_code() {
        let (_store, _pool, service) = setup(AllowAll).await;
        let link = service
            .create("https://example.com", Some("owner-1"), None, None)
            .await
            .unwrap();
        assert_eq!(link.short_code.len(), 7);
        assert!(link.short_code.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(link.status, LinkStatus::Active);
    }

    #[tokio::test]
    async fn custom_codes_are_validated() {
        let (_store, _pool, service) = setup(AllowAll).await;
        service
            .create("https://example.com", None, Some("my-link"), None)
            .await
            .unwrap();
        assert!(matches!(
            service.create("https://example.com", None, Some("my-link"), None).await,
            Err(LinkError::CodeTaken(_))
        ));
        assert!(matches!(
            service.create("https://example.com", None, Some("bad code!"), None).await,
            Err(LinkError::InvalidCode)
        ));
    }

    #[tokio::test]
    async fn code_taken_between_check_and_insert_is_reported_as_taken() {
        let (_store, pool, service) = setup(AllowAll).await;
        db::seed(&pool, "dup", None).await;

        assert!(matches!(
            service.insert("dup", "https://example.com", None, None).await,
            Err(LinkError::CodeTaken(code)) if code == "dup"
        ));
    }

    #[tokio::test]
    async fn generated_code_collisions_are_retried() {
        let (_store, pool, service) = setup(AllowAll).await;
        db::seed(&pool, "taken77", None).await;

        let mut codes = vec!["fresh77", "taken77"];
        let link = service
            .insert_generated("https://example.com", None, None, |_| {
                codes.pop().unwrap().to_owned()
            })
            .await
            .unwrap();
        assert_eq!(link.short_code, "fresh77");
    }

    #[tokio::test]
    async fn generation_gives_up_after_repeated_collisions() {
        let (_store, pool, service) = setup(AllowAll).await;
        db::seed(&pool, "taken77", None).await;

        let mut lengths = Vec::new();
        let result = service
            .insert_generated("https://example.com", None, None, |len| {
                lengths.push(len);
                "taken77".to_owned()
            })
            .await;
        assert!(matches!(result, Err(LinkError::NoFreeCode)));
        assert_eq!(lengths.len(), GENERATE_ATTEMPTS);
        assert_eq!(lengths.last(), Some(&9));
    }

    #[tokio::test]
    async fn unsafe_urls_are_rejected() {
        let (_store, _pool, service) = setup(BlockEverything).await;
        assert!(matches!(
            service.create("https://bad.example", None, None, None).await,
            Err(LinkError::Unsafe(reason)) if reason == "phishing"
        ));
    }

    #[tokio::test]
    async fn mutations_evict_the_cached_snapshot() {
        let (store, pool, service) = setup(AllowAll).await;
        service
            .create("https://example.com", None, Some("abc"), None)
            .await
            .unwrap();
        let resolver = Resolver::new(Arc::new(store.clone()), pool.clone(), Duration::from_secs(1));

        assert!(matches!(resolver.resolve("abc").await, Resolution::Redirect(_)));
        assert!(store.ttl("url:abc").await.unwrap().unwrap() <= CACHE_TTL);

        assert!(service.deactivate("abc", "owner-1", "user").await.unwrap());
        assert_eq!(store.get("url:abc").await.unwrap(), None);
        assert_eq!(resolver.resolve("abc").await, Resolution::Invalid);

        assert!(service.reactivate("abc").await.unwrap());
        assert!(matches!(resolver.resolve("abc").await, Resolution::Redirect(_)));

        assert!(service.delete("abc", "admin-1", "admin").await.unwrap());
        assert_eq!(store.get("url:abc").await.unwrap(), None);
        assert_eq!(resolver.resolve("abc").await, Resolution::Invalid);
    }
}
