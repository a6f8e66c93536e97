use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;

use super::{EphemeralStore, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Counter(i64),
    Hash(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process ephemeral store for single-node deployments and tests.
///
/// Backed by a DashMap: every mutating operation holds the shard lock of its
/// key for the whole read-modify-write, which gives the same per-key
/// atomicity Redis gives. Expired keys are dropped lazily on access and
/// swept whenever a scan starts from cursor 0.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<DashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.iter().filter(|slot| slot.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self, key: &str, now: Instant) -> Option<Slot> {
        let slot = self.inner.get(key).map(|slot| slot.clone())?;
        if slot.is_live(now) {
            return Some(slot);
        }
        self.inner.remove_if(key, |_, slot| !slot.is_live(now));
        None
    }

    fn merge_into(&self, key: &str, fields: HashMap<String, i64>) {
        if fields.is_empty() {
            return;
        }
        let mut slot = self
            .inner
            .entry(key.to_owned())
            .or_insert_with(|| Slot::new(Value::Hash(HashMap::new())));
        if let Value::Hash(ref mut existing) = slot.value {
            for (field, by) in fields {
                *existing.entry(field).or_insert(0) += by;
            }
        }
    }
}

fn scan_position(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live(key, Instant::now()).map(|slot| slot.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text)),
            Some(Value::Counter(n)) => Ok(Some(n.to_string())),
            Some(Value::Hash(_)) => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.inner.insert(
            key.to_owned(),
            Slot {
                value: Value::Text(value.to_owned()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|key| self.inner.remove(key))
            .filter(|(_, slot)| slot.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut slot = self
            .inner
            .entry(key.to_owned())
            .or_insert_with(|| Slot::new(Value::Counter(0)));
        if !slot.is_live(now) {
            *slot = Slot::new(Value::Counter(0));
        }

        let count = match slot.value {
            Value::Counter(ref mut n) => {
                *n += 1;
                *n
            }
            _ => return Err(StoreError::WrongType(key.to_owned())),
        };
        if count == 1 {
            slot.expires_at = Some(now + window);
        }
        Ok(count)
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut slot = self
            .inner
            .entry(key.to_owned())
            .or_insert_with(|| Slot::new(Value::Hash(HashMap::new())));
        if !slot.is_live(now) {
            *slot = Slot::new(Value::Hash(HashMap::new()));
        }

        match slot.value {
            Value::Hash(ref mut fields) => {
                let total = fields.entry(field.to_owned()).or_insert(0);
                *total += by;
                Ok(*total)
            }
            _ => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        match self.live(key, Instant::now()).map(|slot| slot.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(fields)) => Ok(fields),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn claim_hash(
        &self,
        source: &str,
        dest: &str,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let now = Instant::now();

        if let Some(slot) = self.live(dest, now) {
            if !matches!(slot.value, Value::Hash(_)) {
                return Err(StoreError::WrongType(dest.to_owned()));
            }
        }

        // Increments arriving after this remove start a fresh `source` key,
        // so nothing written to it can be lost between here and the merge.
        let moved = match self.inner.remove(source) {
            Some((_, slot)) if slot.is_live(now) => match slot.value {
                Value::Hash(fields) => fields,
                other => {
                    self.inner.insert(source.to_owned(), Slot::new(other));
                    return Err(StoreError::WrongType(source.to_owned()));
                }
            },
            _ => HashMap::new(),
        };

        let claimed = {
            let mut slot = self
                .inner
                .entry(dest.to_owned())
                .or_insert_with(|| Slot::new(Value::Hash(HashMap::new())));
            if !slot.is_live(now) {
                *slot = Slot::new(Value::Hash(HashMap::new()));
            }
            if !matches!(slot.value, Value::Hash(_)) {
                // `dest` changed type after the check above; hand the
                // fields back to `source` instead of dropping them.
                drop(slot);
                self.merge_into(source, moved);
                return Err(StoreError::WrongType(dest.to_owned()));
            }
            match slot.value {
                Value::Hash(ref mut fields) => {
                    for (field, by) in moved {
                        *fields.entry(field).or_insert(0) += by;
                    }
                    fields.clone()
                }
                _ => HashMap::new(),
            }
        };

        if claimed.is_empty() {
            self.inner.remove(dest);
        }
        Ok(claimed)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let now = Instant::now();
        if cursor == 0 {
            self.inner.retain(|_, slot| slot.is_live(now));
        }

        // Keys are visited in order of a stable hash and the cursor is the
        // next hash to visit, so deleting keys mid-scan never shifts the
        // remaining ones past the cursor.
        let mut matching: Vec<(u64, String)> = self
            .inner
            .iter()
            .filter(|entry| entry.is_live(now) && matches_pattern(entry.key(), pattern))
            .map(|entry| (scan_position(entry.key()), entry.key().clone()))
            .filter(|(position, _)| *position >= cursor)
            .collect();
        matching.sort();

        let mut end = count.max(1).min(matching.len());
        while end < matching.len() && matching[end].0 == matching[end - 1].0 {
            end += 1;
        }
        let next = matching.get(end).map_or(0, |(position, _)| *position);
        let page = matching.drain(..end).map(|(_, key)| key).collect();
        Ok((next, page))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self
            .live(key, now)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_counter_resets_after_ttl() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);

        assert_eq!(store.incr_window("burst:x:1.1.1.1", window).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(store.incr_window("burst:x:1.1.1.1", window).await.unwrap(), 2);

        // The TTL is set by the first increment only, so the window does not slide.
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(store.incr_window("burst:x:1.1.1.1", window).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_ex_expires() {
        let store = MemoryStore::new();
        store
            .set_ex("url:abc", "{}", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(
            store.ttl("url:abc").await.unwrap(),
            Some(Duration::from_secs(300))
        );

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(store.get("url:abc").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn claim_moves_and_merges() {
        let store = MemoryStore::new();
        store.hincr("stats:a", "clicks", 3).await.unwrap();
        store.hincr("stats-inflight:a", "clicks", 2).await.unwrap();
        store.hincr("stats-inflight:a", "abuse", 5).await.unwrap();

        let claimed = store.claim_hash("stats:a", "stats-inflight:a").await.unwrap();
        assert_eq!(claimed.get("clicks"), Some(&5));
        assert_eq!(claimed.get("abuse"), Some(&5));
        assert!(store.hgetall("stats:a").await.unwrap().is_empty());

        // Increments after the claim land in a fresh source key.
        store.hincr("stats:a", "clicks", 1).await.unwrap();
        assert_eq!(store.hgetall("stats:a").await.unwrap().get("clicks"), Some(&1));
    }

    #[tokio::test]
    async fn claim_into_wrong_type_keeps_the_source() {
        let store = MemoryStore::new();
        store.hincr("stats:a", "clicks", 4).await.unwrap();
        store
            .set_ex("stats-inflight:a", "oops", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(
            store.claim_hash("stats:a", "stats-inflight:a").await,
            Err(StoreError::WrongType(key)) if key == "stats-inflight:a"
        ));
        assert_eq!(store.hgetall("stats:a").await.unwrap().get("clicks"), Some(&4));
    }

    #[tokio::test]
    async fn claim_of_nothing_leaves_no_key() {
        let store = MemoryStore::new();
        let claimed = store.claim_hash("stats:none", "stats-inflight:none").await.unwrap();
        assert!(claimed.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = MemoryStore::new();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    store
                        .incr_window("abuse:9.9.9.9", Duration::from_secs(600))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.get("abuse:9.9.9.9").await.unwrap().as_deref(), Some("2000"));
    }

    #[tokio::test]
    async fn scan_pages_through_matching_keys() {
        let store = MemoryStore::new();
        for code in ["a", "b", "c", "d", "e"] {
            store.hincr(&format!("stats:{code}"), "clicks", 1).await.unwrap();
        }
        store
            .set_ex("url:a", "{}", Duration::from_secs(300))
            .await
            .unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, page) = store.scan(cursor, "stats:*", 2).await.unwrap();
            assert!(page.len() <= 2);
            seen.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        seen.sort();
        assert_eq!(seen, ["stats:a", "stats:b", "stats:c", "stats:d", "stats:e"]);
    }

    #[tokio::test]
    async fn deleting_during_a_scan_skips_nothing() {
        let store = MemoryStore::new();
        let codes: Vec<String> = (0..20).map(|i| format!("stats:{i}")).collect();
        for key in &codes {
            store.hincr(key, "clicks", 1).await.unwrap();
        }

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, page) = store.scan(cursor, "stats:*", 3).await.unwrap();
            store.delete(&page).await.unwrap();
            seen.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        seen.sort();
        let mut expected = codes.clone();
        expected.sort();
        assert_eq!(seen, expected);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.hincr("stats:a", "clicks", 1).await.unwrap();
        assert!(matches!(
            store.get("stats:a").await,
            Err(StoreError::WrongType(_))
        ));
    }
}
