//! Term canonicalization strategies.
//!
//! Two generations of canonical names exist side by side: display names from an
//! ordered rule table (`"PostgreSQL"`, `"Next.js"`) and URL-safe slugs
//! (`"postgresql"`, `"nextjs"`). A destination collection is written by exactly
//! one strategy.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

/// Maps raw attribute strings to canonical names.
pub trait TermCanonicalizer: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// Canonical name for `raw`, or `None` when the value carries no usable term.
    fn canonicalize(&self, raw: &str) -> Option<String>;

    /// Non-string values never canonicalize.
    fn canonicalize_value(&self, raw: &Value) -> Option<String> {
        raw.as_str().and_then(|s| self.canonicalize(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Rule-table display names.
    Display,
    /// Structural substitution plus ASCII-folded slugs.
    Slug,
}

impl Strategy {
    pub fn canonicalizer(self) -> &'static dyn TermCanonicalizer {
        static DISPLAY: DisplayCanonicalizer = DisplayCanonicalizer;
        static SLUG: SlugCanonicalizer = SlugCanonicalizer;
        match self {
            Strategy::Display => &DISPLAY,
            Strategy::Slug => &SLUG,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Display => f.write_str("display"),
            Strategy::Slug => f.write_str("slug"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "display" => Ok(Strategy::Display),
            "slug" => Ok(Strategy::Slug),
            other => Err(format!("unknown canonicalization strategy `{other}`")),
        }
    }
}

/// Ordered `(pattern, canonical)` pairs. Evaluated top to bottom against the
/// collapsed term, first match wins.
const DISPLAY_RULES: &[(&str, &str)] = &[
    // javascript frameworks
    (r"^react(?:\.js|js)?$", "React"),
    (r"^vue(?:\.js|js)?$", "Vue"),
    (r"^angular(?:\.js|js)?$", "Angular"),
    (r"^next(?:\.js|js)?$", "Next.js"),
    (r"^nuxt(?:\.js|js)?$", "Nuxt"),
    (r"^svelte(?:\.js|js)?$", "Svelte"),
    // python
    (r"^python$", "Python"),
    (r"^django$", "Django"),
    (r"^fastapi$", "FastAPI"),
    (r"^flask$", "Flask"),
    (r"^pytorch$", "PyTorch"),
    (r"^tensorflow$", "TensorFlow"),
    // node
    (r"^node(?:\.?js)?$", "Node.js"),
    (r"^express(?:\.js|js)?$", "Express"),
    // databases
    (r"^postgre?sql$", "PostgreSQL"),
    (r"^mongo(?:db)?$", "MongoDB"),
    (r"^redis$", "Redis"),
    (r"^mysql$", "MySQL"),
    (r"^dynamodb$", "DynamoDB"),
    (r"^elasticsearch$", "Elasticsearch"),
    // cloud
    (r"^aws$", "AWS"),
    (r"^gcp$", "GCP"),
    (r"^azure$", "Azure"),
    (r"^docker$", "Docker"),
    (r"^kubernetes$", "Kubernetes"),
    // languages
    (r"^java(?:script)?$", "JavaScript"),
    (r"^type(?:script)?$", "TypeScript"),
    (r"^c#$", "C#"),
    (r"^c\+\+$", "C++"),
    (r"^golang|go$", "Go"),
    (r"^rust$", "Rust"),
    // tools
    (r"^git$", "Git"),
    (r"^jenkins$", "Jenkins"),
    (r"^github$", "GitHub"),
    (r"^gitlab$", "GitLab"),
];

struct DisplayRule {
    pattern: Regex,
    canonical: &'static str,
}

// Each pattern is anchored at the start of the input so alternations such as
// `^golang|go$` only ever match from position zero.
static COMPILED_RULES: LazyLock<Vec<DisplayRule>> = LazyLock::new(|| {
    DISPLAY_RULES
        .iter()
        .map(|&(pattern, canonical)| DisplayRule {
            pattern: Regex::new(&format!("^(?:{pattern})"))
                .expect("display rule patterns are valid"),
            canonical,
        })
        .collect()
});

static STRUCTURAL_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-_.]+").expect("punctuation pattern is valid"));

/// Rule-table strategy producing display-cased canonical names.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayCanonicalizer;

impl DisplayCanonicalizer {
    /// Canonical name of the first rule matching `collapsed`.
    pub fn match_rule(collapsed: &str) -> Option<&'static str> {
        COMPILED_RULES
            .iter()
            .find(|rule| rule.pattern.is_match(collapsed))
            .map(|rule| rule.canonical)
    }
}

impl TermCanonicalizer for DisplayCanonicalizer {
    fn strategy(&self) -> Strategy {
        Strategy::Display
    }

    fn canonicalize(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let lowered = trimmed.to_lowercase();
        let collapsed = STRUCTURAL_PUNCTUATION.replace_all(&lowered, "");
        if let Some(canonical) = Self::match_rule(&collapsed) {
            return Some(canonical.to_string());
        }

        Some(
            trimmed
                .split('.')
                .map(title_case)
                .collect::<Vec<_>>()
                .join("."),
        )
    }
}

/// Exact aliases applied before slugging.
const STRUCTURAL_MAP: &[(&str, &str)] = &[
    ("c#", "csharp"),
    ("csharp", "csharp"),
    ("c++", "cpp"),
    ("cpp", "cpp"),
    (".net", "dotnet"),
    ("node.js", "nodejs"),
    ("next.js", "nextjs"),
    ("nuxt.js", "nuxtjs"),
    ("express.js", "express"),
    ("postgres", "postgresql"),
    ("postgresql", "postgresql"),
    ("mongo", "mongodb"),
    ("mongodb", "mongodb"),
];

/// Base names whose `.js` suffix folds into the slug (`nuxt.js` -> `nuxtjs`).
const JS_SUFFIX_BASES: &[&str] = &["node", "next", "nuxt", "express"];

static NON_ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern is valid"));
static REPEATED_HYPHENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{2,}").expect("hyphen pattern is valid"));

/// Slug strategy producing `^[a-z0-9]+(-[a-z0-9]+)*$` identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlugCanonicalizer;

impl SlugCanonicalizer {
    fn structural_pass(raw: &str) -> String {
        let lowered = raw.trim().to_lowercase();
        if let Some(mapped) = structural_alias(&lowered) {
            return mapped.to_string();
        }
        if let Some(base) = lowered.strip_suffix(".js") {
            if JS_SUFFIX_BASES.contains(&base) {
                return format!("{base}js");
            }
        }
        lowered
    }

    /// Whether `slug` is a well-formed, non-empty slug.
    pub fn is_valid_slug(slug: &str) -> bool {
        !slug.is_empty()
            && !slug.starts_with('-')
            && !slug.ends_with('-')
            && !slug.contains("--")
            && slug
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    }
}

fn structural_alias(lowered: &str) -> Option<&'static str> {
    STRUCTURAL_MAP
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, slug)| *slug)
}

impl TermCanonicalizer for SlugCanonicalizer {
    fn strategy(&self) -> Strategy {
        Strategy::Slug
    }

    fn canonicalize(&self, raw: &str) -> Option<String> {
        if raw.trim().is_empty() {
            return None;
        }

        let structural = Self::structural_pass(raw);
        let folded: String = structural
            .nfkd()
            .filter(char::is_ascii)
            .collect::<String>()
            .to_ascii_lowercase();
        let hyphenated = NON_ALPHANUMERIC.replace_all(&folded, "-");
        let slug = REPEATED_HYPHENS
            .replace_all(&hyphenated, "-")
            .trim_matches('-')
            .to_string();

        debug_assert!(slug.is_empty() || Self::is_valid_slug(&slug), "bad slug {slug:?}");
        (!slug.is_empty()).then_some(slug)
    }
}

/// Storage key for a canonical name: lowercased, spaces to hyphens, dots removed.
pub fn derive_term_id(name: &str) -> String {
    name.to_lowercase().replace(' ', "-").replace('.', "")
}

/// Word-wise title casing: a cased character following another cased
/// character is lowercased, any other is uppercased.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_cased = false;
    for ch in input.chars() {
        if prev_cased {
            out.extend(ch.to_lowercase());
        } else {
            out.extend(ch.to_uppercase());
        }
        prev_cased = ch.is_lowercase() || ch.is_uppercase();
    }
    out
}
