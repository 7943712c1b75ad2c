//! Query fingerprinting and relation extraction.
//!
//! Both operations are pure functions over the query text and share one
//! lexer. Fingerprints group queries that differ only in constant values
//! (and in trailing LIMIT/OFFSET), so `WHERE id = 1` and `WHERE id = 2`
//! hash the same.

mod lexer;
mod normalize;
mod relation;

use std::sync::LazyLock;

use regex::Regex;
use xxhash_rust::xxh3::xxh3_64;

pub use lexer::LexError;
pub use normalize::normalize;
pub use relation::{ParseError, Statement, TableRef, parse};

static LIMIT_OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s+(LIMIT\s+\$\d+(\s+OFFSET\s+\$\d+)?|OFFSET\s+\$\d+(\s+LIMIT\s+\$\d+)?)\s*$",
    )
    .unwrap()
});

/// Result of fingerprinting a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: u64,
    /// The text that was hashed.
    pub normalized: String,
}

/// Fingerprint a query. Never fails: if the query cannot be tokenized the
/// trimmed original text is hashed instead.
pub fn fingerprint(query: &str) -> Fingerprint {
    let trimmed = trim_statement(query);
    let normalized = match normalize(trimmed) {
        Ok(n) => strip_pagination(&n),
        Err(_) => trimmed.to_string(),
    };
    Fingerprint {
        hash: xxh3_64(normalized.as_bytes()),
        normalized,
    }
}

/// Like [`fingerprint`] but returns `None` unless the text parses as SQL.
pub fn fingerprint_strict(query: &str) -> Option<u64> {
    let trimmed = trim_statement(query);
    parse(trimmed).ok()?;
    let normalized = normalize(trimmed).ok()?;
    Some(xxh3_64(strip_pagination(&normalized).as_bytes()))
}

/// Primary relation of a query: the DML target, or the first table of a
/// SELECT's FROM list. Unquoted names are lower-cased; the schema is dropped.
pub fn extract_relation(query: &str) -> Option<String> {
    let statements = parse(query).ok()?;
    statements
        .iter()
        .find_map(|s| s.relation())
        .map(|t| t.name.clone())
}

fn trim_statement(query: &str) -> &str {
    query.trim().trim_end_matches(';').trim_end()
}

fn strip_pagination(normalized: &str) -> String {
    LIMIT_OFFSET_RE.replace(normalized, "").into_owned()
}
