use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    check_batch_size, dedup_by_key, ContinuationToken, Item, KeySpec, Projection, ScanPage,
    SinkStore, SourceStore, StoreError,
};

type Collection = BTreeMap<String, Item>;

/// Ordered in-memory collections. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<BTreeMap<String, Collection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a collection without the batch ceiling.
    pub async fn insert(
        &self,
        collection: &str,
        key: &KeySpec,
        items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        let rows = dedup_by_key(key, items)?;
        let written = rows.len();
        let mut collections = self.collections.lock().await;
        let target = collections.entry(collection.to_string()).or_default();
        target.extend(rows);
        Ok(written)
    }

    /// Items of a collection in key order.
    pub async fn snapshot(&self, collection: &str) -> Vec<Item> {
        let collections = self.collections.lock().await;
        collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        let collections = self.collections.lock().await;
        collections.get(collection).map(BTreeMap::len).unwrap_or(0)
    }

    pub async fn collection_names(&self) -> Vec<String> {
        self.collections.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn scan(
        &self,
        collection: &str,
        projection: &Projection,
        start: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        let collections = self.collections.lock().await;
        let Some(items) = collections.get(collection) else {
            return Ok(ScanPage::default());
        };

        let lower = match start {
            Some(token) => Bound::Excluded(token.as_str().to_string()),
            None => Bound::Unbounded,
        };
        let mut range = items.range((lower, Bound::Unbounded));
        let mut page = Vec::new();
        let mut last_key = None;
        for (key, item) in range.by_ref().take(limit.max(1)) {
            page.push(projection.apply(item));
            last_key = Some(key.clone());
        }
        let next = match range.next() {
            Some(_) => last_key.map(ContinuationToken::new),
            None => None,
        };
        Ok(ScanPage { items: page, next })
    }
}

#[async_trait]
impl SinkStore for MemoryStore {
    async fn batch_upsert(
        &self,
        collection: &str,
        key: &KeySpec,
        items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        check_batch_size(&items)?;
        self.insert(collection, key, items).await
    }
}
