//! Per-run term aggregation: canonical sets, frequency tables and index rows.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use jpx_core::{
    format_utc, normalize_timestamp, split_industries, AttributeCategory, CanonicalTerm,
    IndexEntry, PostingError, SourcePosting, Strategy,
};
use serde::Serialize;
use tracing::warn;

use crate::config::IndexTarget;

/// Run-scoped posting counts per canonical name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrequencyTable {
    counts: BTreeMap<String, u64>,
}

impl FrequencyTable {
    pub fn record(&mut self, name: &str) {
        *self.counts.entry(name.to_string()).or_default() += 1;
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Terms in name order.
    pub fn terms(&self) -> Vec<CanonicalTerm> {
        self.counts
            .iter()
            .map(|(name, count)| CanonicalTerm {
                posting_count: *count,
                ..CanonicalTerm::new(name.clone())
            })
            .collect()
    }
}

/// Lookup-table row: a canonical term stamped with the run clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupRow {
    #[serde(flatten)]
    pub term: CanonicalTerm,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// Everything one posting contributes, computed before any shared state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPosting {
    pub job_id: String,
    /// Display-strategy canonical sets, absent categories omitted.
    pub terms: BTreeMap<AttributeCategory, BTreeSet<String>>,
    /// Index rows per configured target, in target order.
    pub index_rows: Vec<Vec<IndexEntry>>,
}

impl PreparedPosting {
    pub fn index_row_count(&self) -> usize {
        self.index_rows.iter().map(Vec::len).sum()
    }
}

/// Accumulates frequency tables across a run.
///
/// [`Aggregator::prepare`] leaves shared state untouched; counts change only in
/// [`Aggregator::commit`], so a posting dropped between the two leaves nothing
/// behind.
#[derive(Debug, Clone)]
pub struct Aggregator {
    as_of: DateTime<Utc>,
    targets: Vec<IndexTarget>,
    tables: BTreeMap<AttributeCategory, FrequencyTable>,
}

impl Aggregator {
    pub fn new(as_of: DateTime<Utc>, targets: Vec<IndexTarget>) -> Self {
        Self {
            as_of,
            targets,
            tables: BTreeMap::new(),
        }
    }

    /// A category holding the wrong JSON type contributes no terms; the rest of
    /// the posting is still aggregated.
    pub fn prepare(&self, posting: &SourcePosting, job_id: &str) -> PreparedPosting {
        let mut terms = BTreeMap::new();
        for category in AttributeCategory::ALL {
            let set = lenient_set(posting, job_id, category, Strategy::Display);
            if !set.is_empty() {
                terms.insert(category, set);
            }
        }

        let status = posting.index_status();
        let processed = normalize_timestamp(posting.processed_date(), self.as_of);
        let mut index_rows = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let names = match target.strategy {
                Strategy::Display => terms.get(&target.category).cloned().unwrap_or_default(),
                strategy => lenient_set(posting, job_id, target.category, strategy),
            };
            index_rows.push(
                names
                    .iter()
                    .map(|name| {
                        IndexEntry::new(name, &status, &processed, job_id)
                            .labelled(target.category, target.strategy)
                    })
                    .collect(),
            );
        }

        PreparedPosting {
            job_id: job_id.to_string(),
            terms,
            index_rows,
        }
    }

    /// Counts each canonical term once for this posting.
    pub fn commit(&mut self, prepared: &PreparedPosting) {
        for (category, names) in &prepared.terms {
            let table = self.tables.entry(*category).or_default();
            for name in names {
                table.record(name);
            }
        }
    }

    pub fn table(&self, category: AttributeCategory) -> Option<&FrequencyTable> {
        self.tables.get(&category)
    }

    pub fn unique_terms(&self) -> BTreeMap<AttributeCategory, usize> {
        AttributeCategory::ALL
            .iter()
            .map(|c| (*c, self.tables.get(c).map(FrequencyTable::len).unwrap_or(0)))
            .collect()
    }

    /// Lookup rows of one category in name order.
    pub fn lookup_rows(&self, category: AttributeCategory) -> Vec<LookupRow> {
        let created_at = format_utc(self.as_of);
        self.tables
            .get(&category)
            .map(|table| {
                table
                    .terms()
                    .into_iter()
                    .map(|term| LookupRow {
                        term,
                        created_at: created_at.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn lenient_set(
    posting: &SourcePosting,
    job_id: &str,
    category: AttributeCategory,
    strategy: Strategy,
) -> BTreeSet<String> {
    canonical_set(posting, category, strategy).unwrap_or_else(|err| {
        warn!(job_id, field = category.field_name(), error = %err, "ignoring malformed category");
        BTreeSet::new()
    })
}

/// Deduplicated canonical names of one category under one strategy.
pub fn canonical_set(
    posting: &SourcePosting,
    category: AttributeCategory,
    strategy: Strategy,
) -> Result<BTreeSet<String>, PostingError> {
    let canonicalizer = strategy.canonicalizer();
    if category.is_composite() {
        let Some(raw) = posting.industry()? else {
            return Ok(BTreeSet::new());
        };
        let pieces = split_industries(raw);
        return Ok(match strategy {
            Strategy::Display => pieces,
            Strategy::Slug => pieces
                .iter()
                .filter_map(|piece| canonicalizer.canonicalize(piece))
                .collect(),
        });
    }

    Ok(posting
        .attribute_values(category)?
        .unwrap_or_default()
        .iter()
        .filter_map(|value| canonicalizer.canonicalize_value(value))
        .collect())
}
