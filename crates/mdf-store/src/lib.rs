//! Harvest result cache + relational product sink for MDF.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use mdf_core::{DecomposedListing, ListingRecord};

pub const CRATE_NAME: &str = "mdf-store";

/// Freshness window for cached harvest results.
pub const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Derive a filesystem-safe cache key from a search query: alphanumerics,
/// spaces, hyphens and underscores survive, everything else is stripped,
/// trailing whitespace trimmed.
pub fn cache_key(query: &str) -> String {
    query
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// An entry written at age zero is fresh strictly up to the TTL.
pub fn is_fresh(age: Duration, ttl: Duration) -> bool {
    age < ttl
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no fresh cache entry for key '{key}'")]
    Miss { key: String },
    #[error("cache entry for key '{key}' is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// TTL-keyed persistence of harvest results. One JSON file per sanitized
/// query; the file mtime is the freshness timestamp.
#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ttl: CACHE_TTL,
        }
    }

    pub fn with_ttl(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("cache_{key}.json"))
    }

    async fn entry_age(&self, key: &str) -> Option<Duration> {
        let metadata = fs::metadata(self.path_for(key)).await.ok()?;
        let modified = metadata.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }

    /// True iff an entry exists and its mtime is within the TTL.
    pub async fn is_valid(&self, key: &str) -> bool {
        match self.entry_age(key).await {
            Some(age) => is_fresh(age, self.ttl),
            None => false,
        }
    }

    /// Load the cached records for `key`. A missing or stale entry is a
    /// [`CacheError::Miss`]; an unparseable payload is
    /// [`CacheError::Corrupt`] so the caller can log and degrade to a live
    /// harvest instead of crashing.
    pub async fn load(&self, key: &str) -> Result<Vec<ListingRecord>, CacheError> {
        if !self.is_valid(key).await {
            return Err(CacheError::Miss {
                key: key.to_string(),
            });
        }
        let path = self.path_for(key);
        let bytes = fs::read(&path).await?;
        let records = serde_json::from_slice(&bytes).map_err(|source| CacheError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        debug!(key, path = %path.display(), "loaded cached harvest");
        Ok(records)
    }

    /// Persist records for `key` via temp-file write + atomic rename. An
    /// existing entry is overwritten, refreshing its mtime.
    pub async fn store(&self, key: &str, records: &[ListingRecord]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).await?;
        let path = self.path_for(key);
        let payload = serde_json::to_vec_pretty(records).map_err(|source| CacheError::Corrupt {
            key: key.to_string(),
            source,
        })?;

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &payload).await?;
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        info!(key, records = records.len(), path = %path.display(), "stored harvest in cache");
        Ok(())
    }
}

/// SQLite-backed product store; rows are upserted by listing URL.
#[derive(Debug, Clone)]
pub struct ProductStore {
    pool: SqlitePool,
}

impl ProductStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                price INTEGER NOT NULL,
                url TEXT UNIQUE NOT NULL,
                marketplace TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating products table")?;
        Ok(())
    }

    /// Upsert the harvested listings, keyed by URL. Listings without a URL
    /// have no stable identity and are skipped. Returns the number of rows
    /// written.
    pub async fn upsert_listings(
        &self,
        listings: &[DecomposedListing],
        marketplace: &str,
    ) -> anyhow::Result<usize> {
        let now = Utc::now().to_rfc3339();
        let mut written = 0usize;
        for listing in listings {
            if listing.record.url.is_empty() {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO products (name, price, url, marketplace, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                ON CONFLICT(url) DO UPDATE SET
                    name = excluded.name,
                    price = excluded.price,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&listing.record.title)
            .bind(listing.attributes.price_numeric)
            .bind(&listing.record.url)
            .bind(marketplace)
            .bind(&now)
            .execute(&self.pool)
            .await
            .with_context(|| format!("upserting product {}", listing.record.url))?;
            written += 1;
        }
        info!(written, marketplace, "upserted products");
        Ok(written)
    }

    pub async fn count_products(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM products")
            .fetch_one(&self.pool)
            .await
            .context("counting products")?;
        Ok(row.get::<i64, _>("n"))
    }
}

/// Path-based SQLite URL that creates the database file on first use.
pub fn sqlite_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}
