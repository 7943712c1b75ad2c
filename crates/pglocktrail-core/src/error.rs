//! Error types shared across the crate.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of a tailer scan.
///
/// Per-file and per-record problems never surface here: they are skipped
/// and logged. Only stage-level failures reach the caller.
#[derive(Debug, Error)]
pub enum TailError {
    /// The directory/glob could not be listed.
    #[error("glob log files {pattern}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: SourceError,
    },
    /// A log file could not be opened.
    #[error("open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// One or more events could not be stored. Checkpoints were still advanced.
    #[error("store: {failed} event(s) failed, {persisted} persisted: {source}")]
    Store {
        persisted: usize,
        failed: usize,
        #[source]
        source: StoreError,
    },
    /// The scan was cancelled; unflushed state was discarded.
    #[error("scan cancelled")]
    Cancelled,
}

/// Failure of a log byte source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("PostgreSQL: {0}")]
    Postgres(String),
}

/// Failure of the persistence boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a lock-graph sample.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("PostgreSQL query error: {0}")]
    Query(String),
    #[error("lock graph source is poisoned")]
    Poisoned,
}
