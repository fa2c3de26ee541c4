use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    check_batch_size, dedup_by_key, validate_collection_name, ContinuationToken, Item, KeySpec,
    Projection, ScanPage, SinkStore, SourceStore, StoreError,
};

type Collection = BTreeMap<String, Item>;

/// One `<collection>.json` file per collection under a root directory.
///
/// Files hold a key -> item object. A JSON array (a raw export) is accepted
/// when reading; its items are keyed by zero-padded position.
///
/// Upserts change the in-memory copy only. [`JsonDirStore::flush_dirty`] (and
/// [`SinkStore::sync`]) rewrites each changed file once, through a temp file
/// and rename.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
    state: Arc<Mutex<CacheState>>,
}

#[derive(Debug, Default)]
struct CacheState {
    collections: HashMap<String, Arc<Collection>>,
    dirty: BTreeSet<String>,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }

    async fn load<'s>(
        &self,
        state: &'s mut CacheState,
        collection: &str,
    ) -> Result<&'s mut Arc<Collection>, StoreError> {
        match state.collections.entry(collection.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = self.collection_path(collection);
                let loaded = if fs::try_exists(&path).await? {
                    let text = fs::read_to_string(&path).await?;
                    parse_collection(collection, &text)?
                } else {
                    Collection::new()
                };
                debug!(collection, items = loaded.len(), path = %path.display(), "loaded collection");
                Ok(entry.insert(Arc::new(loaded)))
            }
        }
    }

    /// Writes every collection changed since the last flush and returns how
    /// many files were rewritten. A failed write stays pending.
    pub async fn flush_dirty(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut rewritten = 0;
        while let Some(collection) = state.dirty.pop_first() {
            let Some(items) = state.collections.get(&collection).cloned() else {
                continue;
            };
            if let Err(err) = self.persist(&collection, &items).await {
                state.dirty.insert(collection);
                return Err(err);
            }
            debug!(collection = %collection, items = items.len(), "collection persisted");
            rewritten += 1;
        }
        Ok(rewritten)
    }

    async fn persist(&self, collection: &str, items: &Collection) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        let path = self.collection_path(collection);
        let temp_path = self.root.join(format!(".{collection}.{}.tmp", Uuid::new_v4()));

        let mut bytes = serde_json::to_vec_pretty(items)?;
        bytes.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

fn parse_collection(collection: &str, text: &str) -> Result<Collection, StoreError> {
    if text.trim().is_empty() {
        return Ok(Collection::new());
    }
    match serde_json::from_str::<Value>(text)? {
        Value::Object(entries) => {
            let mut out = Collection::new();
            for (key, value) in entries {
                match value {
                    Value::Object(item) => {
                        out.insert(key, item);
                    }
                    _ => warn!(collection, key = %key, "skipping non-object entry"),
                }
            }
            Ok(out)
        }
        Value::Array(values) => {
            let mut out = Collection::new();
            for (position, value) in values.into_iter().enumerate() {
                match value {
                    Value::Object(item) => {
                        out.insert(format!("{position:08}"), item);
                    }
                    _ => warn!(collection, position, "skipping non-object array element"),
                }
            }
            Ok(out)
        }
        _ => Err(StoreError::CorruptCollection {
            collection: collection.to_string(),
        }),
    }
}

#[async_trait]
impl SourceStore for JsonDirStore {
    async fn scan(
        &self,
        collection: &str,
        projection: &Projection,
        start: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        validate_collection_name(collection)?;
        let items = {
            let mut state = self.state.lock().await;
            self.load(&mut state, collection).await?.clone()
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
impl SinkStore for JsonDirStore {
    async fn batch_upsert(
        &self,
        collection: &str,
        key: &KeySpec,
        items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        validate_collection_name(collection)?;
        check_batch_size(&items)?;
        let rows = dedup_by_key(key, items)?;
        let written = rows.len();

        let mut state = self.state.lock().await;
        let loaded = self.load(&mut state, collection).await?;
        Arc::make_mut(loaded).extend(rows);
        state.dirty.insert(collection.to_string());
        Ok(written)
    }

    async fn sync(&self) -> Result<(), StoreError> {
        self.flush_dirty().await.map(|_| ())
    }
}
