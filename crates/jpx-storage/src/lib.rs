//! Paginated key-value collection storage for JPX.
//!
//! The pipeline reads the source collection through [`SourceStore::scan`] and
//! writes destinations through [`SinkStore::batch_upsert`]. Every write is an
//! overwrite-by-key, so replaying a batch leaves the collection unchanged.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

mod json_dir;
mod memory;
mod postgres;

pub use json_dir::JsonDirStore;
pub use memory::MemoryStore;
pub use postgres::{classify_sqlx_error, PgStore};

pub const CRATE_NAME: &str = "jpx-storage";

/// Upstream ceiling on items per `batch_upsert` call.
pub const MAX_BATCH_SIZE: usize = 500;

/// A stored record.
pub type Item = Map<String, Value>;

const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item is missing key field `{field}`")]
    MissingKey { field: String },
    #[error("batch of {size} items exceeds the {max}-item ceiling")]
    BatchTooLarge { size: usize, max: usize },
    #[error("invalid collection name `{0}`")]
    InvalidCollection(String),
    #[error("collection `{collection}` is not a JSON object or array")]
    CorruptCollection { collection: String },
    #[error("unsupported store url `{0}`")]
    UnsupportedUrl(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Ordered field names forming the dedup/overwrite key of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    fields: Vec<String>,
}

impl KeySpec {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Composite key of `item`. String parts are used verbatim, other values
    /// in their JSON form.
    pub fn key_of(&self, item: &Item) -> Result<String, StoreError> {
        let mut key = String::new();
        for (i, field) in self.fields.iter().enumerate() {
            let part = match item.get(field) {
                None | Some(Value::Null) => {
                    return Err(StoreError::MissingKey {
                        field: field.clone(),
                    })
                }
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(&part);
        }
        Ok(key)
    }
}

/// Fields to return from a scan; `all()` returns records unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    fields: Option<Vec<String>>,
}

impl Projection {
    pub fn all() -> Self {
        Self { fields: None }
    }

    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }

    pub fn field_names(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }

    pub fn apply(&self, item: &Item) -> Item {
        match &self.fields {
            None => item.clone(),
            Some(fields) => fields
                .iter()
                .filter_map(|f| item.get(f).map(|v| (f.clone(), v.clone())))
                .collect(),
        }
    }
}

/// Opaque resume point returned by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    pub next: Option<ContinuationToken>,
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// One page of at most `limit` records, starting after `start`.
    async fn scan(
        &self,
        collection: &str,
        projection: &Projection,
        start: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError>;
}

#[async_trait]
pub trait SinkStore: Send + Sync {
    /// Overwrites each item by its `key` and returns the number written.
    async fn batch_upsert(
        &self,
        collection: &str,
        key: &KeySpec,
        items: Vec<Item>,
    ) -> Result<usize, StoreError>;

    /// Makes every write accepted so far durable. Stores that persist inside
    /// `batch_upsert` keep the default.
    async fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub fn check_batch_size(items: &[Item]) -> Result<(), StoreError> {
    if items.len() > MAX_BATCH_SIZE {
        return Err(StoreError::BatchTooLarge {
            size: items.len(),
            max: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}

/// Keys every item and collapses duplicates to their last occurrence, keeping
/// the position of the first.
pub fn dedup_by_key(key: &KeySpec, items: Vec<Item>) -> Result<Vec<(String, Item)>, StoreError> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<(String, Item)> = Vec::with_capacity(items.len());
    for item in items {
        let k = key.key_of(&item)?;
        match positions.get(&k) {
            Some(&pos) => out[pos].1 = item,
            None => {
                positions.insert(k.clone(), out.len());
                out.push((k, item));
            }
        }
    }
    Ok(out)
}

pub(crate) fn validate_collection_name(collection: &str) -> Result<(), StoreError> {
    let valid = !collection.is_empty()
        && !collection.starts_with('.')
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(collection.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
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
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Any backend selectable from a store URL.
#[derive(Debug, Clone)]
pub enum AnyStore {
    Memory(MemoryStore),
    JsonDir(JsonDirStore),
    Postgres(PgStore),
}

impl AnyStore {
    /// `memory:`, `postgres://…`/`postgresql://…`, or a directory path
    /// (optionally `file://`-prefixed).
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StoreError::UnsupportedUrl(url.to_string()));
        }
        if url == "memory:" {
            return Ok(AnyStore::Memory(MemoryStore::new()));
        }
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(AnyStore::Postgres(PgStore::connect(url).await?));
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        Ok(AnyStore::JsonDir(JsonDirStore::new(path)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AnyStore::Memory(_) => "memory",
            AnyStore::JsonDir(_) => "json-dir",
            AnyStore::Postgres(_) => "postgres",
        }
    }
}

#[async_trait]
impl SourceStore for AnyStore {
    async fn scan(
        &self,
        collection: &str,
        projection: &Projection,
        start: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        match self {
            AnyStore::Memory(s) => s.scan(collection, projection, start, limit).await,
            AnyStore::JsonDir(s) => s.scan(collection, projection, start, limit).await,
            AnyStore::Postgres(s) => s.scan(collection, projection, start, limit).await,
        }
    }
}

#[async_trait]
impl SinkStore for AnyStore {
    async fn batch_upsert(
        &self,
        collection: &str,
        key: &KeySpec,
        items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        match self {
            AnyStore::Memory(s) => s.batch_upsert(collection, key, items).await,
            AnyStore::JsonDir(s) => s.batch_upsert(collection, key, items).await,
            AnyStore::Postgres(s) => s.batch_upsert(collection, key, items).await,
        }
    }

    async fn sync(&self) -> Result<(), StoreError> {
        match self {
            AnyStore::Memory(s) => s.sync().await,
            AnyStore::JsonDir(s) => s.sync().await,
            AnyStore::Postgres(s) => s.sync().await,
        }
    }
}
