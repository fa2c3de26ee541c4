//! Core domain model and term normalization for JPX.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod canonical;
pub mod industry;
pub mod timestamp;

pub use canonical::{
    derive_term_id, title_case, DisplayCanonicalizer, SlugCanonicalizer, Strategy,
    TermCanonicalizer,
};
pub use industry::split_industries;
pub use timestamp::{format_utc, normalize_timestamp, parse_timestamp};

pub const CRATE_NAME: &str = "jpx-core";

/// Status used for index sort keys when the posting carries none.
pub const DEFAULT_STATUS: &str = "Active";

/// Prefix of the composite partition key that embeds a job identifier.
pub const JOB_KEY_PREFIX: &str = "JOB#";

/// Attribute categories carried by a source posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeCategory {
    Technologies,
    Skills,
    Benefits,
    Requirements,
    Industries,
}

impl AttributeCategory {
    pub const ALL: [AttributeCategory; 5] = [
        AttributeCategory::Technologies,
        AttributeCategory::Skills,
        AttributeCategory::Benefits,
        AttributeCategory::Requirements,
        AttributeCategory::Industries,
    ];

    /// Name of the field holding this category on a source posting.
    pub fn field_name(self) -> &'static str {
        match self {
            AttributeCategory::Technologies => "technologies",
            AttributeCategory::Skills => "skills",
            AttributeCategory::Benefits => "benefits",
            AttributeCategory::Requirements => "requirements",
            AttributeCategory::Industries => "industry",
        }
    }

    /// Composite categories hold one delimited string instead of a list.
    pub fn is_composite(self) -> bool {
        matches!(self, AttributeCategory::Industries)
    }
}

impl fmt::Display for AttributeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeCategory::Technologies => "technologies",
            AttributeCategory::Skills => "skills",
            AttributeCategory::Benefits => "benefits",
            AttributeCategory::Requirements => "requirements",
            AttributeCategory::Industries => "industries",
        };
        f.write_str(name)
    }
}

/// A canonical attribute value with its run-derived posting count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalTerm {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "postingCount")]
    pub posting_count: u64,
}

impl CanonicalTerm {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: derive_term_id(&name),
            name,
            posting_count: 0,
        }
    }
}

/// One (canonical term, posting) row of an inverted index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "PK")]
    pub partition_key: String,
    #[serde(rename = "SK")]
    pub sort_key: String,
    #[serde(rename = "jobId")]
    pub job_id: String,
    /// Copy of the display term, set on display technology indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tech: Option<String>,
    /// Copy of the slug, set on slug indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

impl IndexEntry {
    pub fn new(term: &str, status: &str, processed_date: &str, job_id: &str) -> Self {
        Self {
            partition_key: term.to_string(),
            sort_key: Self::sort_key(status, processed_date, job_id),
            job_id: job_id.to_string(),
            tech: None,
            slug: None,
        }
    }

    /// Adds the convenience attribute readers of each index generation expect.
    pub fn labelled(mut self, category: AttributeCategory, strategy: Strategy) -> Self {
        match strategy {
            Strategy::Display if category == AttributeCategory::Technologies => {
                self.tech = Some(self.partition_key.clone());
            }
            Strategy::Display => {}
            Strategy::Slug => self.slug = Some(self.partition_key.clone()),
        }
        self
    }

    /// `<status>#<timestamp>#<jobId>`: groups by status, then recency, then job.
    pub fn sort_key(status: &str, processed_date: &str, job_id: &str) -> String {
        format!("{status}#{processed_date}#{job_id}")
    }
}

/// Denormalized, default-filled projection of a source posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatViewPosting {
    #[serde(rename = "Id")]
    pub id: String,
    pub job_title: Value,
    pub job_description: Value,
    pub normalized: bool,
    pub normalized_at: String,
    pub processed_date: String,
    pub company_name: Value,
    pub company_size: Value,
    pub location: Value,
    pub remote_status: Value,
    pub salary_mentioned: Value,
    pub salary_range: Value,
    pub seniority_level: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostingError {
    #[error("field `{field}` should be a list, found {found}")]
    NotAList { field: &'static str, found: &'static str },
    #[error("field `{field}` should be a string, found {found}")]
    NotAString { field: &'static str, found: &'static str },
}

/// Upstream job posting as read from the source collection.
///
/// Source records are operator-entered and loosely typed, so the posting keeps
/// its raw fields and exposes tolerant accessors for the ones the pipeline uses.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePosting {
    fields: Map<String, Value>,
}

impl SourcePosting {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Explicit `id`/`Id`/`jobId`, else the suffix of a `JOB#`-prefixed `PK`.
    pub fn job_id(&self) -> Option<String> {
        for name in ["id", "Id", "jobId"] {
            if let Some(id) = self.fields.get(name).and_then(identifier_text) {
                return Some(id);
            }
        }
        self.fields
            .get("PK")
            .and_then(Value::as_str)
            .and_then(|pk| pk.strip_prefix(JOB_KEY_PREFIX))
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
    }

    pub fn status(&self) -> Option<&Value> {
        self.fields.get("status")
    }

    /// Status for sort-key construction: trimmed, defaulting to `Active`.
    pub fn index_status(&self) -> String {
        self.status()
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_STATUS)
            .to_string()
    }

    pub fn processed_date(&self) -> Option<&Value> {
        self.fields.get("processed_date")
    }

    /// Raw values of a list category. `None` when absent, null or empty.
    pub fn attribute_values(
        &self,
        category: AttributeCategory,
    ) -> Result<Option<&[Value]>, PostingError> {
        let field = category.field_name();
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(values)) if values.is_empty() => Ok(None),
            Some(Value::Array(values)) => Ok(Some(values.as_slice())),
            Some(other) => Err(PostingError::NotAList {
                field,
                found: json_kind(other),
            }),
        }
    }

    /// The composite industry string. `None` when absent, null or blank.
    pub fn industry(&self) -> Result<Option<&str>, PostingError> {
        let field = AttributeCategory::Industries.field_name();
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(PostingError::NotAString {
                field,
                found: json_kind(other),
            }),
        }
    }
}

impl From<Map<String, Value>> for SourcePosting {
    fn from(fields: Map<String, Value>) -> Self {
        Self::new(fields)
    }
}

fn identifier_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
