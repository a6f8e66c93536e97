use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a short link. Stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Inactive,
    Expired,
    Deleted,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Active => "active",
            LinkStatus::Inactive => "inactive",
            LinkStatus::Expired => "expired",
            LinkStatus::Deleted => "deleted",
        }
    }
}

/// A row from the `short_links` table.
///
/// Column names are camelCase because the CRUD layer reads and writes the
/// same table by those names.
#[derive(Debug, Clone, sqlx::FromRow)]
#[sqlx(rename_all = "camelCase")]
pub struct ShortLink {
    pub id: i64,
    pub short_code: String,
    pub original_url: String,
    pub owner: Option<String>,
    pub is_active: bool,
    pub status: LinkStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub clicks: i64,
    pub abuse_score: i64,
    pub last_abuse_at: Option<DateTime<Utc>>,
    pub disabled_by: Option<String>,
    pub disabled_by_role: Option<String>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    pub deleted_by_role: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ShortLink {
    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        is_servable(self.is_active, self.status, self.expires_at, now)
    }

    /// The read-only snapshot written to `url:<code>`.
    pub fn to_cache_entry(&self) -> CacheEntry {
        CacheEntry {
            original_url: self.original_url.clone(),
            is_active: self.is_active,
            status: self.status,
            expires_at: self.expires_at,
        }
    }
}

/// Cached projection of a [`ShortLink`]. Never written back to the durable
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub original_url: String,
    pub is_active: bool,
    pub status: LinkStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        is_servable(self.is_active, self.status, self.expires_at, now)
    }
}

/// A link may be redirected to only while it is active, not deleted, and not
/// past its expiry. Expiry is checked here so it holds even before the sweeper
/// has caught up.
fn is_servable(
    is_active: bool,
    status: LinkStatus,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if !is_active || status == LinkStatus::Deleted {
        return false;
    }
    !matches!(expires_at, Some(at) if at <= now)
}
