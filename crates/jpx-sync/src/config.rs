//! Pipeline configuration: YAML collection layout plus environment overrides.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use jpx_core::{AttributeCategory, Strategy};
use jpx_storage::MAX_BATCH_SIZE;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SOURCE_COLLECTION: &str = "job-postings-enhanced";
pub const DEFAULT_STORE_URL: &str = "./data";
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_STATUS_WINDOW_DAYS: i64 = 30;
pub const DEFAULT_CONFIG_FILE: &str = "jpx.yaml";

/// One inverted index destination. A collection is written by one strategy only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTarget {
    pub collection: String,
    #[serde(default = "default_index_category")]
    pub category: AttributeCategory,
    pub strategy: Strategy,
}

fn default_index_category() -> AttributeCategory {
    AttributeCategory::Technologies
}

/// Destination collection layout, as read from `jpx.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionsConfig {
    #[serde(default = "default_lookup_tables")]
    pub lookup_tables: BTreeMap<AttributeCategory, String>,
    #[serde(default = "default_flat_view")]
    pub flat_view: String,
    #[serde(default = "default_indexes")]
    pub indexes: Vec<IndexTarget>,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            lookup_tables: default_lookup_tables(),
            flat_view: default_flat_view(),
            indexes: default_indexes(),
        }
    }
}

fn default_lookup_tables() -> BTreeMap<AttributeCategory, String> {
    BTreeMap::from([
        (AttributeCategory::Technologies, "job-postings-technologies".to_string()),
        (AttributeCategory::Skills, "job-postings-skills".to_string()),
        (AttributeCategory::Benefits, "job-postings-benefits".to_string()),
        (AttributeCategory::Requirements, "job-postings-requirements".to_string()),
        (AttributeCategory::Industries, "job-postings-industries".to_string()),
    ])
}

fn default_flat_view() -> String {
    "job-postings-normalized".to_string()
}

fn default_indexes() -> Vec<IndexTarget> {
    vec![
        IndexTarget {
            collection: "job-tech-index".to_string(),
            category: AttributeCategory::Technologies,
            strategy: Strategy::Display,
        },
        IndexTarget {
            collection: "job-tech-index-v2".to_string(),
            category: AttributeCategory::Technologies,
            strategy: Strategy::Slug,
        },
    ]
}

impl CollectionsConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing collection layout")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Every destination is a distinct collection, so no collection ever mixes
    /// row shapes or canonicalization strategies.
    pub fn validate(&self, source_collection: &str) -> Result<()> {
        let mut seen = BTreeSet::new();
        let destinations = self
            .lookup_tables
            .values()
            .chain(std::iter::once(&self.flat_view))
            .chain(self.indexes.iter().map(|i| &i.collection));
        for collection in destinations {
            if collection.trim().is_empty() {
                bail!("destination collection names cannot be empty");
            }
            if collection == source_collection {
                bail!("destination `{collection}` is the source collection");
            }
            if !seen.insert(collection.as_str()) {
                bail!("collection `{collection}` is configured as more than one destination");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Lookup tables, flat view and indexes.
    Normalize,
    /// Indexes only.
    IndexOnly,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store_url: String,
    pub source_collection: String,
    pub collections: CollectionsConfig,
    pub batch_size: usize,
    pub page_size: usize,
    pub as_of: DateTime<Utc>,
    pub status_window_days: i64,
    pub mode: RunMode,
    pub dry_run: bool,
    pub use_projection: bool,
    pub progress_every: usize,
    pub reports_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_string(),
            source_collection: DEFAULT_SOURCE_COLLECTION.to_string(),
            collections: CollectionsConfig::default(),
            batch_size: MAX_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            as_of: Utc::now(),
            status_window_days: DEFAULT_STATUS_WINDOW_DAYS,
            mode: RunMode::Normalize,
            dry_run: false,
            use_projection: true,
            progress_every: 100,
            reports_dir: PathBuf::from("./reports"),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from a variable lookup. `JPX_CONFIG` names the YAML
    /// layout file; `./jpx.yaml` is used when present.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let layout_path = lookup("JPX_CONFIG").map(PathBuf::from).or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        });
        if let Some(path) = layout_path {
            config.collections = CollectionsConfig::load(&path)?;
        }

        if let Some(url) = lookup("JPX_STORE_URL") {
            config.store_url = url;
        }
        if let Some(source) = lookup("JPX_SOURCE_COLLECTION") {
            config.source_collection = source;
        }
        if let Some(raw) = lookup("JPX_BATCH_SIZE") {
            config.batch_size = parse_number("JPX_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("JPX_PAGE_SIZE") {
            config.page_size = parse_number("JPX_PAGE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("JPX_STATUS_WINDOW_DAYS") {
            config.status_window_days = parse_number("JPX_STATUS_WINDOW_DAYS", &raw)?;
        }
        if let Some(raw) = lookup("JPX_AS_OF") {
            config.as_of = parse_as_of(&raw)?;
        }
        if let Some(dir) = lookup("JPX_REPORTS_DIR") {
            config.reports_dir = PathBuf::from(dir);
        }

        Ok(config.normalized())
    }

    /// Clamps sizes into their accepted ranges.
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.clamp(1, MAX_BATCH_SIZE);
        self.page_size = self.page_size.max(1);
        self.progress_every = self.progress_every.max(1);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_collection.trim().is_empty() {
            bail!("source collection name cannot be empty");
        }
        if self.status_window_days < 0 {
            bail!("status window cannot be negative");
        }
        if TimeDelta::try_days(self.status_window_days).is_none() {
            bail!("status window of {} days is out of range", self.status_window_days);
        }
        self.collections.validate(&self.source_collection)
    }
}

fn parse_number<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{name} must be a number, got `{raw}`"))
}

/// Parses an RFC 3339 run clock override.
pub fn parse_as_of(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("as-of `{raw}` is not an RFC 3339 timestamp"))
}
