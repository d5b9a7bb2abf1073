//! Persistence adapter + HTTP fetch utilities for the catalog sync.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tcgp_core::Card;
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcgp-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("upsert rejected for {0}")]
    UpsertRejected(String),
}

/// Write/read primitives the reconciler consumes.
#[async_trait]
pub trait CardStore: Send + Sync {
    /// Insert-or-overwrite of all card fields, keyed by id.
    async fn upsert(&self, card: &Card) -> Result<(), StoreError>;

    /// All persisted card ids.
    async fn list_all_ids(&self) -> Result<HashSet<String>, StoreError>;

    /// Whether any dependent record references this card id.
    async fn exists_dependent_reference(&self, id: &str) -> Result<bool, StoreError>;

    /// Deletes the card only when no dependent reference exists. The check
    /// and the delete execute as one atomic operation so a reference created
    /// concurrently can never be orphaned. Returns whether a row was deleted.
    async fn delete_if_unreferenced(&self, id: &str) -> Result<bool, StoreError>;
}

/// Storage for imported third-party collection snapshots, latest-wins per user.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn upsert_collection_snapshot(
        &self,
        user_id: &str,
        player_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// Postgres-backed catalog store.
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to catalog database")?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying catalog migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CardStore for PgCatalogStore {
    async fn upsert(&self, card: &Card) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cards (id, name, image, pack_set, source_set, rarity) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET \
                 name = EXCLUDED.name, \
                 image = EXCLUDED.image, \
                 pack_set = EXCLUDED.pack_set, \
                 source_set = EXCLUDED.source_set, \
                 rarity = EXCLUDED.rarity, \
                 updated_at = now()",
        )
        .bind(&card.id)
        .bind(&card.display_name)
        .bind(&card.image_ref)
        .bind(&card.set_label)
        .bind(&card.source_set_code)
        .bind(i32::from(card.rarity_tier))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_all_ids(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM cards")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("id"))
            .collect())
    }

    async fn exists_dependent_reference(&self, id: &str) -> Result<bool, StoreError> {
        let row =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM user_cards WHERE card_id = $1) AS present")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get::<bool, _>("present"))
    }

    async fn delete_if_unreferenced(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM cards \
             WHERE id = $1 \
               AND NOT EXISTS (SELECT 1 FROM user_cards WHERE card_id = cards.id)",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CollectionStore for PgCatalogStore {
    async fn upsert_collection_snapshot(
        &self,
        user_id: &str,
        player_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pzone_collections (user_id, player_id, payload, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 player_id = EXCLUDED.player_id, \
                 payload = EXCLUDED.payload, \
                 updated_at = now()",
        )
        .bind(user_id)
        .bind(player_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory catalog store used by pipeline tests.
#[derive(Default)]
pub struct MemoryCatalogStore {
    state: tokio::sync::Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    cards: HashMap<String, Card>,
    references: HashSet<String>,
    rejected_upserts: HashSet<String>,
    snapshots: HashMap<String, (String, serde_json::Value)>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_card(&self, card: Card) {
        self.state.lock().await.cards.insert(card.id.clone(), card);
    }

    pub async fn add_dependent_reference(&self, id: &str) {
        self.state.lock().await.references.insert(id.to_string());
    }

    /// Makes subsequent upserts of this id fail, for failure-isolation tests.
    pub async fn reject_upserts_for(&self, id: &str) {
        self.state
            .lock()
            .await
            .rejected_upserts
            .insert(id.to_string());
    }

    pub async fn card(&self, id: &str) -> Option<Card> {
        self.state.lock().await.cards.get(id).cloned()
    }

    pub async fn card_count(&self) -> usize {
        self.state.lock().await.cards.len()
    }

    pub async fn snapshot_for(&self, user_id: &str) -> Option<(String, serde_json::Value)> {
        self.state.lock().await.snapshots.get(user_id).cloned()
    }
}

#[async_trait]
impl CardStore for MemoryCatalogStore {
    async fn upsert(&self, card: &Card) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.rejected_upserts.contains(&card.id) {
            return Err(StoreError::UpsertRejected(card.id.clone()));
        }
        state.cards.insert(card.id.clone(), card.clone());
        Ok(())
    }

    async fn list_all_ids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.state.lock().await.cards.keys().cloned().collect())
    }

    async fn exists_dependent_reference(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.references.contains(id))
    }

    async fn delete_if_unreferenced(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.references.contains(id) {
            return Ok(false);
        }
        Ok(state.cards.remove(id).is_some())
    }
}

#[async_trait]
impl CollectionStore for MemoryCatalogStore {
    async fn upsert_collection_snapshot(
        &self,
        user_id: &str,
        player_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.state.lock().await.snapshots.insert(
            user_id.to_string(),
            (player_id.to_string(), payload.clone()),
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body from {url}: {message}")]
    InvalidBody { url: String, message: String },
}

/// Shared HTTP client with status-aware retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        self.fetch_text_with_retry(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_text_with_retry(&self, url: &str) -> Result<String, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    pub async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let body = self.fetch_text(url).await?;
        serde_json::from_str(&body).map_err(|err| FetchError::InvalidBody {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedDocument {
    pub content_hash: String,
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of fetched source documents, so a run
/// can be re-parsed or inspected without re-fetching.
#[derive(Debug, Clone)]
pub struct DocumentArchive {
    root: PathBuf,
}

impl DocumentArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }

    /// Stores a fetched document under `<date>/<partition>/<sha256>.html`.
    /// Identical content archives to the same path and is silently skipped.
    pub async fn store_document(
        &self,
        fetched_at: DateTime<Utc>,
        partition_key: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedDocument> {
        let content_hash = Self::sha256_hex(bytes);
        let dir = self
            .root
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(Self::sanitize_key(partition_key));
        let path = dir.join(format!("{content_hash}.html"));

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archive path {}", path.display()))?
        {
            return Ok(ArchivedDocument {
                content_hash,
                path,
                deduplicated: true,
            });
        }

        // Temp-file + rename keeps readers from ever seeing a partial write.
        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(ArchivedDocument {
                content_hash,
                path,
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
                    .with_context(|| format!("renaming temp archive file into {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_card(id: &str) -> Card {
        Card {
            id: id.to_string(),
            display_name: "Pikachu".to_string(),
            set_label: "Puissance Génétique".to_string(),
            source_set_code: "Genetic Apex".to_string(),
            rarity_tier: 1,
            image_ref: "https://pocket.limitlesstcg.com/cards/a1/1.webp".to_string(),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_are_classified() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_content() {
        let dir = tempdir().expect("tempdir");
        let archive = DocumentArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-08-01T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_document(fetched_at, "set:A1", b"<html>same</html>")
            .await
            .expect("first store");
        let second = archive
            .store_document(fetched_at, "set:A1", b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.path, second.path);
        assert!(first.path.exists());
    }

    #[tokio::test]
    async fn memory_store_upserts_and_lists() {
        let store = MemoryCatalogStore::new();
        store
            .upsert(&sample_card("Pikachu Genetic Apex 1"))
            .await
            .expect("upsert");
        store
            .upsert(&sample_card("Pikachu Genetic Apex 1"))
            .await
            .expect("re-upsert");
        let ids = store.list_all_ids().await.expect("ids");
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("Pikachu Genetic Apex 1"));
    }

    #[tokio::test]
    async fn memory_store_refuses_to_delete_referenced_cards() {
        let store = MemoryCatalogStore::new();
        store
            .upsert(&sample_card("Pikachu Genetic Apex 1"))
            .await
            .expect("upsert");
        store.add_dependent_reference("Pikachu Genetic Apex 1").await;

        let deleted = store
            .delete_if_unreferenced("Pikachu Genetic Apex 1")
            .await
            .expect("delete attempt");
        assert!(!deleted);
        assert!(store.card("Pikachu Genetic Apex 1").await.is_some());

        let exists = store
            .exists_dependent_reference("Pikachu Genetic Apex 1")
            .await
            .expect("exists");
        assert!(exists);
    }
}
