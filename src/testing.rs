//! Test doubles shared across modules.

use async_trait::async_trait;
use std::{collections::HashMap, time::Duration};

use crate::store::{EphemeralStore, StoreError};

/// A store whose every call fails as if the server were unreachable.
pub struct FailingStore;

fn down() -> StoreError {
    StoreError::Timeout(Duration::from_millis(500))
}

#[async_trait]
impl EphemeralStore for FailingStore {
    async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
        Err(down())
    }

    async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
        Err(down())
    }

    async fn delete(&self, _: &[String]) -> Result<u64, StoreError> {
        Err(down())
    }

    async fn incr_window(&self, _: &str, _: Duration) -> Result<i64, StoreError> {
        Err(down())
    }

    async fn hincr(&self, _: &str, _: &str, _: i64) -> Result<i64, StoreError> {
        Err(down())
    }

    async fn hgetall(&self, _: &str) -> Result<HashMap<String, i64>, StoreError> {
        Err(down())
    }

    async fn claim_hash(&self, _: &str, _: &str) -> Result<HashMap<String, i64>, StoreError> {
        Err(down())
    }

    async fn scan(&self, _: u64, _: &str, _: usize) -> Result<(u64, Vec<String>), StoreError> {
        Err(down())
    }

    async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
        Err(down())
    }
}
