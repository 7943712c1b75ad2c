//! pglocktrail-core - PostgreSQL deadlock collection.
//!
//! Provides:
//! - `tailer` - incremental deadlock extraction from stderr, csvlog and jsonlog files
//! - `session_cache` - short-lived pid → session timing snapshots from `pg_locks`
//! - `fingerprint` - query normalization, fingerprints and relation extraction
//! - `source` - log location discovery and file access (filesystem or `pg_read_binary_file`)
//! - `store` - event/checkpoint persistence boundary
//! - `monitor` - periodic scanning with format re-detection
//! - `model` - deadlock event data model

pub mod cancel;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod monitor;
pub mod pg;
pub mod session_cache;
pub mod source;
pub mod store;
pub mod tailer;
pub mod time;

pub use cancel::CancelToken;
pub use error::{CacheError, SourceError, StoreError, TailError};
pub use model::{Checkpoints, DeadlockEvent, DeadlockProcess, SessionState};
pub use monitor::{DeadlockMonitor, FormatProbe, PgFormatProbe};
pub use session_cache::{CacheConfig, SessionCache};
pub use source::{AccessMethod, LogFormat, LogSource};
pub use store::{EventStore, JsonFileStore, MemoryStore};
pub use tailer::{DeadlockTailer, TailerConfig, new_tailer};
