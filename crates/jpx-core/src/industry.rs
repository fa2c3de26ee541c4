//! Composite industry field splitting.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::canonical::title_case;

const DELIMITER: &str = "|";

static AND_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+and\s+").expect("and separator pattern is valid"));
static SLASH_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*/\s*").expect("slash separator pattern is valid"));
static AMPERSAND_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*&\s*").expect("ampersand separator pattern is valid"));

/// Splits an industry string joined by `and`, `/` or `&` into title-cased,
/// de-duplicated industries. Callers must not rely on the iteration order.
pub fn split_industries(raw: &str) -> BTreeSet<String> {
    let joined = AND_SEPARATOR.replace_all(raw, DELIMITER);
    let joined = SLASH_SEPARATOR.replace_all(&joined, DELIMITER);
    let joined = AMPERSAND_SEPARATOR.replace_all(&joined, DELIMITER);

    joined
        .split(DELIMITER)
        .map(|piece| title_case(piece.trim()))
        .filter(|piece| !piece.is_empty())
        .collect()
}
