//! Expiring key-value job cache (file and Postgres backends) + HTTP fetch utilities for GoApply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use goapply_core::{Job, Metadata, ScrapeState, SourceStatus};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "goapply-storage";

/// Logical key layout shared by every backend.
pub mod keys {
    pub const ALL_JOBS: &str = "jobs.all";
    pub const METADATA: &str = "jobs.metadata";
    pub const SCRAPE_LOCK: &str = "jobs.scrapeLock";

    pub fn by_source(source: &str) -> String {
        format!("jobs.bySource.{source}")
    }

    pub fn status(source: &str) -> String {
        format!("jobs.status.{source}")
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Raw expiring key-value contract. Every operation is safe under concurrent callers.
#[async_trait]
pub trait KvBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `None` for missing and for expired keys.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError>;

    /// Atomic check-and-set: writes only when the key is absent or expired.
    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> Result<bool, StoreError>;

    /// Idempotent: deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

fn expires_at_from_now(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
    Utc::now() + ttl
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    expires_at: DateTime<Utc>,
    value: Value,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// In-process file-backed store: one JSON file per key, replaced by atomic temp-file rename.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    /// Serializes every mutation that replaces or removes an entry file in this process.
    write_gate: Mutex<()>,
}

impl FileBackend {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "file store initialized");
        Ok(Self {
            root,
            write_gate: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let file_name = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();
        self.root.join(format!("{file_name}.json"))
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<StoredEntry>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the whole entry to a hidden temp file next to its final location.
    async fn write_temp(&self, entry: &StoredEntry) -> Result<PathBuf, StoreError> {
        let bytes = serde_json::to_vec(entry)?;
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        Ok(temp_path)
    }

    async fn remove_if_present(path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn link_if_absent(&self, temp_path: &Path, path: &Path) -> Result<bool, StoreError> {
        for _ in 0..2 {
            match fs::hard_link(temp_path, path).await {
                Ok(()) => return Ok(true),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let reclaimable = match self.read_entry(path).await {
                        Ok(Some(existing)) => existing.is_expired(),
                        Ok(None) => continue,
                        Err(StoreError::Serde(_)) => true,
                        Err(err) => return Err(err),
                    };
                    if !reclaimable {
                        return Ok(false);
                    }
                    warn!(path = %path.display(), "reclaiming expired entry");
                    let tombstone = self.root.join(format!(".{}.stale", Uuid::new_v4()));
                    match fs::rename(path, &tombstone).await {
                        Ok(()) => Self::remove_if_present(&tombstone).await?,
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl KvBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.entry_path(key);
        // Expired files are only unlinked by `purge_expired`, under the write gate.
        match self.read_entry(&path).await? {
            Some(entry) if entry.is_expired() => Ok(None),
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        let entry = StoredEntry {
            expires_at: expires_at_from_now(ttl),
            value,
        };
        let temp_path = self.write_temp(&entry).await?;
        let _gate = self.write_gate.lock().await;
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> Result<bool, StoreError> {
        let _gate = self.write_gate.lock().await;
        let path = self.entry_path(key);
        let entry = StoredEntry {
            expires_at: expires_at_from_now(ttl),
            value,
        };
        let temp_path = self.write_temp(&entry).await?;
        let result = self.link_if_absent(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;
        result
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        Self::remove_if_present(&self.entry_path(key)).await
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut purged = 0u64;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let is_entry = path.extension().is_some_and(|ext| ext == "json")
                && !item.file_name().to_string_lossy().starts_with('.');
            if !is_entry {
                continue;
            }
            // Re-read under the gate so a fresh entry renamed into place is never unlinked.
            let _gate = self.write_gate.lock().await;
            let expired = match self.read_entry(&path).await {
                Ok(Some(entry)) => entry.is_expired(),
                Ok(None) => false,
                Err(StoreError::Serde(_)) => true,
                Err(err) => return Err(err),
            };
            if expired {
                Self::remove_if_present(&path).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

/// Shared store backed by a Postgres `kv_entries` table; expiry is judged by the database clock.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl KvBackend for PgBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT value
              FROM kv_entries
             WHERE key = $1
               AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Value, _>("value")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expires_at = EXCLUDED.expires_at
             WHERE kv_entries.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub entry_ttl: Duration,
    pub lock_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(24 * 60 * 60),
            lock_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockToken {
    run_id: String,
    acquired_at: DateTime<Utc>,
}

struct JobStoreInner {
    backend: Arc<dyn KvBackend>,
    config: StoreConfig,
    write_gate: Mutex<()>,
}

/// Typed job cache over any [`KvBackend`].
///
/// Reads never fail: a backend or decoding error is logged and the documented
/// default is returned. Writes surface [`StoreError`] to the caller.
#[derive(Clone)]
pub struct JobStore {
    inner: Arc<JobStoreInner>,
}

impl JobStore {
    pub fn new(backend: Arc<dyn KvBackend>, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(JobStoreInner {
                backend,
                config,
                write_gate: Mutex::new(()),
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn config(&self) -> StoreConfig {
        self.inner.config
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.inner.backend.get(key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(decoded) => Some(decoded),
                Err(err) => {
                    error!(key, error = %err, "decoding cached entry failed");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                error!(key, error = %err, "reading cached entry failed");
                None
            }
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.inner
            .backend
            .set(key, value, self.inner.config.entry_ttl)
            .await
    }

    /// Replaces the aggregate collection in one write.
    pub async fn put_all_jobs(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let _gate = self.inner.write_gate.lock().await;
        self.write(keys::ALL_JOBS, jobs).await?;
        info!(count = jobs.len(), "cached aggregate job collection");
        Ok(())
    }

    pub async fn get_all_jobs(&self) -> Vec<Job> {
        self.read(keys::ALL_JOBS).await.unwrap_or_default()
    }

    /// Swaps out every job attributed to `source` in the aggregate, leaving other sources untouched.
    pub async fn put_source_jobs(&self, source: &str, jobs: &[Job]) -> Result<(), StoreError> {
        let _gate = self.inner.write_gate.lock().await;
        self.write(&keys::by_source(source), jobs).await?;

        // Strict read: other sources' jobs must survive this write.
        let mut all: Vec<Job> = match self.inner.backend.get(keys::ALL_JOBS).await? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        all.retain(|job| job.source != source);
        all.extend(jobs.iter().cloned());
        self.write(keys::ALL_JOBS, &all).await?;
        info!(source, count = jobs.len(), "cached source jobs");
        Ok(())
    }

    pub async fn get_source_jobs(&self, source: &str) -> Vec<Job> {
        if let Some(jobs) = self.read::<Vec<Job>>(&keys::by_source(source)).await {
            return jobs;
        }
        self.get_all_jobs()
            .await
            .into_iter()
            .filter(|job| job.source == source)
            .collect()
    }

    pub async fn put_metadata(&self, metadata: &Metadata) -> Result<(), StoreError> {
        self.write(keys::METADATA, metadata).await
    }

    pub async fn get_metadata(&self) -> Metadata {
        self.read(keys::METADATA).await.unwrap_or_else(Metadata::empty)
    }

    pub async fn put_source_status(
        &self,
        source: &str,
        status: ScrapeState,
        job_count: usize,
        error: Option<String>,
    ) -> Result<SourceStatus, StoreError> {
        let record = SourceStatus::new(status, job_count, error);
        self.write(&keys::status(source), &record).await?;
        info!(source, %status, job_count, "updated source status");
        Ok(record)
    }

    pub async fn get_source_status(&self, source: &str) -> Option<SourceStatus> {
        self.read(&keys::status(source)).await
    }

    /// Non-blocking: `false` when another run holds a live lock (or the backend is unreachable).
    /// The stored token names the acquiring run for diagnostics.
    pub async fn try_acquire_lock(&self, run_id: &str) -> bool {
        let token = LockToken {
            run_id: run_id.to_string(),
            acquired_at: Utc::now(),
        };
        let value = match serde_json::to_value(&token) {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, "encoding scrape lock token failed");
                return false;
            }
        };
        match self
            .inner
            .backend
            .set_if_absent(keys::SCRAPE_LOCK, value, self.inner.config.lock_ttl)
            .await
        {
            Ok(true) => {
                info!(run_id, "scrape lock acquired");
                true
            }
            Ok(false) => {
                warn!("scrape lock already held");
                false
            }
            Err(err) => {
                error!(error = %err, "acquiring scrape lock failed");
                false
            }
        }
    }

    pub async fn release_lock(&self) {
        match self.inner.backend.delete(keys::SCRAPE_LOCK).await {
            Ok(()) => info!("scrape lock released"),
            Err(err) => error!(error = %err, "releasing scrape lock failed"),
        }
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.inner.backend.purge_expired().await
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared outbound HTTP client with a per-request timeout and global/per-source concurrency caps.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Single attempt; retries belong to the caller.
    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", source_id, url);
        async {
            let resp = self.client.get(url).send().await.map_err(|err| classify(err, url))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.text().await.map_err(|err| classify(err, url))?;
            Ok(FetchedPage {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn classify(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}
