use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{info_span, warn, Instrument};

use crate::{
    check_batch_size, dedup_by_key, BackoffPolicy, ContinuationToken, Item, KeySpec, Projection,
    RetryDisposition, ScanPage, SinkStore, SourceStore, StoreError,
};

/// Collections stored as rows of a single `jpx_items` table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::default(),
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt_index = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if classify_sqlx_error(&err) == RetryDisposition::Retryable
                        && attempt_index < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt_index);
                    warn!(operation, attempt = attempt_index, ?delay, error = %err, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt_index += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

async fn scan_once(
    pool: &PgPool,
    collection: &str,
    start: Option<&str>,
    fetch: i64,
) -> Result<Vec<(String, Value)>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT item_key, body
          FROM jpx_items
         WHERE collection = $1
           AND ($2::text IS NULL OR item_key > $2)
         ORDER BY item_key
         LIMIT $3
        "#,
    )
    .bind(collection)
    .bind(start)
    .bind(fetch)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let key: String = row.try_get("item_key")?;
        let body: Value = row.try_get("body")?;
        out.push((key, body));
    }
    Ok(out)
}

async fn upsert_once(
    pool: &PgPool,
    collection: &str,
    rows: &[(String, Item)],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for (key, item) in rows {
        sqlx::query(
            r#"
            INSERT INTO jpx_items (collection, item_key, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, item_key)
            DO UPDATE SET body = EXCLUDED.body, updated_at = now()
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(Json(item))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

#[async_trait]
impl SourceStore for PgStore {
    async fn scan(
        &self,
        collection: &str,
        projection: &Projection,
        start: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        let limit = limit.max(1);
        let start = start.map(ContinuationToken::as_str);
        let fetch = i64::try_from(limit).unwrap_or(i64::MAX - 1) + 1;
        let pool = &self.pool;

        let mut rows = self
            .with_retry("scan", || scan_once(pool, collection, start, fetch))
            .instrument(info_span!("pg_scan", collection, limit))
            .await?;

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next = if has_more {
            rows.last().map(|(key, _)| ContinuationToken::new(key.clone()))
        } else {
            None
        };

        let mut items = Vec::with_capacity(rows.len());
        for (key, body) in rows {
            match body {
                Value::Object(item) => items.push(projection.apply(&item)),
                _ => warn!(collection, key = %key, "skipping non-object row"),
            }
        }
        Ok(ScanPage { items, next })
    }
}

#[async_trait]
impl SinkStore for PgStore {
    async fn batch_upsert(
        &self,
        collection: &str,
        key: &KeySpec,
        items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        check_batch_size(&items)?;
        let rows = dedup_by_key(key, items)?;
        if rows.is_empty() {
            return Ok(0);
        }
        let pool = &self.pool;
        let batch = rows.as_slice();
        self.with_retry("batch_upsert", || upsert_once(pool, collection, batch))
            .instrument(info_span!("pg_upsert", collection, rows = batch.len()))
            .await?;
        Ok(rows.len())
    }
}
