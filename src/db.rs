use crate::models::{LinkStatus, ShortLink};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

const LINK_COLUMNS: &str = "id, shortCode, originalUrl, owner, isActive, status, expiresAt,
     clicks, abuseScore, lastAbuseAt, disabledBy, disabledByRole, disabledAt,
     deletedBy, deletedByRole, createdAt, updatedAt";

// ── Pool ───────────────────────────────────────────────────────────────────

/// Open the SQLite pool (creating the file if needed) and apply the embedded
/// migrations.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(
            database_url
                .parse::<sqlx::sqlite::SqliteConnectOptions>()?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .foreign_keys(true),
        )
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}

// ── Links ──────────────────────────────────────────────────────────────────

/// Fields supplied by whoever creates a link. Everything else starts at its
/// column default.
#[derive(Debug, Clone)]
pub struct NewLink<'a> {
    pub short_code: &'a str,
    pub original_url: &'a str,
    pub owner: Option<&'a str>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn insert_link(pool: &SqlitePool, link: &NewLink<'_>) -> Result<ShortLink, sqlx::Error> {
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO short_links (shortCode, originalUrl, owner, expiresAt, createdAt, updatedAt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
    )
    .bind(link.short_code)
    .bind(link.original_url)
    .bind(link.owner)
    .bind(link.expires_at)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    sqlx::query_as(&format!("SELECT {LINK_COLUMNS} FROM short_links WHERE id = ?1"))
        .bind(id)
        .fetch_one(pool)
        .await
}

/// Fetch a link by short code, whatever its status. Validity is the caller's
/// decision.
pub async fn get_link_by_code(
    pool: &SqlitePool,
    short_code: &str,
) -> Result<Option<ShortLink>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {LINK_COLUMNS} FROM short_links WHERE shortCode = ?1"
    ))
    .bind(short_code)
    .fetch_optional(pool)
    .await
}

// ── Abuse ──────────────────────────────────────────────────────────────────

/// Add to a link's cumulative abuse score. Returns the new score, or `None`
/// when no link has this code.
pub async fn add_abuse_score(
    pool: &SqlitePool,
    short_code: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar(
        "UPDATE short_links
            SET abuseScore = abuseScore + ?1, lastAbuseAt = ?2, updatedAt = ?2
          WHERE shortCode = ?3
      RETURNING abuseScore",
    )
    .bind(amount)
    .bind(now)
    .bind(short_code)
    .fetch_optional(pool)
    .await
}

/// Disable a link on behalf of the system once its score is over
/// `threshold`. The guard on `isActive` makes a repeat a no-op; returns
/// whether this call changed the row.
pub async fn auto_disable(
    pool: &SqlitePool,
    short_code: &str,
    threshold: i64,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let affected = sqlx::query(
        "UPDATE short_links
            SET isActive = 0, status = ?1, disabledBy = NULL, disabledByRole = 'system',
                disabledAt = ?2, updatedAt = ?2
          WHERE shortCode = ?3 AND isActive = 1 AND abuseScore > ?4",
    )
    .bind(LinkStatus::Inactive)
    .bind(now)
    .bind(short_code)
    .bind(threshold)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected > 0)
}

// ── Stats ──────────────────────────────────────────────────────────────────

/// Fold drained telemetry into the durable counters. Returns `false` when no
/// link has this code.
pub async fn apply_stats_delta(
    pool: &SqlitePool,
    short_code: &str,
    clicks: i64,
    abuse: i64,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let affected = sqlx::query(
        "UPDATE short_links
            SET clicks = clicks + ?1,
                abuseScore = abuseScore + ?2,
                lastAbuseAt = CASE WHEN ?2 > 0 THEN ?3 ELSE lastAbuseAt END,
                updatedAt = ?3
          WHERE shortCode = ?4",
    )
    .bind(clicks)
    .bind(abuse)
    .bind(now)
    .bind(short_code)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected > 0)
}

// ── Expiry ─────────────────────────────────────────────────────────────────

/// Move every active link whose expiry has passed to `expired`, in one
/// statement. Returns the codes that changed.
pub async fn expire_links(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        "UPDATE short_links
            SET isActive = 0, status = ?1, updatedAt = ?2
          WHERE isActive = 1 AND expiresAt IS NOT NULL AND expiresAt <= ?2
      RETURNING shortCode",
    )
    .bind(LinkStatus::Expired)
    .bind(now)
    .fetch_all(pool)
    .await
}

// ── Owner / administrator actions ──────────────────────────────────────────

pub async fn deactivate(
    pool: &SqlitePool,
    short_code: &str,
    by: &str,
    role: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let affected = sqlx::query(
        "UPDATE short_links
            SET isActive = 0, status = ?1, disabledBy = ?2, disabledByRole = ?3,
                disabledAt = ?4, updatedAt = ?4
          WHERE shortCode = ?5 AND status IN ('active', 'inactive')",
    )
    .bind(LinkStatus::Inactive)
    .bind(by)
    .bind(role)
    .bind(now)
    .bind(short_code)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected > 0)
}

/// Bring an inactive link back. Expired and deleted links stay where they
/// are.
pub async fn reactivate(
    pool: &SqlitePool,
    short_code: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let affected = sqlx::query(
        "UPDATE short_links
            SET isActive = 1, status = ?1, disabledBy = NULL, disabledByRole = NULL,
                disabledAt = NULL, updatedAt = ?2
          WHERE shortCode = ?3 AND status = 'inactive'",
    )
    .bind(LinkStatus::Active)
    .bind(now)
    .bind(short_code)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected > 0)
}

pub async fn soft_delete(
    pool: &SqlitePool,
    short_code: &str,
    by: &str,
    role: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let affected = sqlx::query(
        "UPDATE short_links
            SET isActive = 0, status = ?1, deletedBy = ?2, deletedByRole = ?3, updatedAt = ?4
          WHERE shortCode = ?5 AND status != 'deleted'",
    )
    .bind(LinkStatus::Deleted)
    .bind(by)
    .bind(role)
    .bind(now)
    .bind(short_code)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected > 0)
}

// ── Test support ───────────────────────────────────────────────────────────

/// A fresh in-memory database with the schema applied. One connection, so
/// every query sees the same database.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[cfg(test)]
pub async fn seed(pool: &SqlitePool, code: &str, expires_at: Option<DateTime<Utc>>) -> ShortLink {
    insert_link(
        pool,
        &NewLink {
            short_code: code,
            original_url: &format!("https://example.com/{code}"),
            owner: Some("owner-1"),
            expires_at,
        },
    )
    .await
    .unwrap()
}
