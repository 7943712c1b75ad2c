//! Session lock-graph cache.
//!
//! PostgreSQL forgets a backend's `xact_start` as soon as the deadlock victim
//! is rolled back, long before the deadlock shows up in the log. The cache
//! samples the live lock-wait graph every second and keeps per-pid
//! transaction timestamps for a minute, so tailers can enrich events after
//! the fact.
//!
//! Two background threads share one map: the sampler upserts both sides of
//! every waiting pair, the cleaner evicts entries past the retention window.

mod pg_source;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::CacheError;
use crate::model::SessionState;

pub use pg_source::PgLockGraphSource;

/// One backend as seen in a lock-graph sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSample {
    pub pid: i32,
    pub backend_start: Option<DateTime<Utc>>,
    pub xact_start: Option<DateTime<Utc>>,
}

/// A waiting backend and the backend holding the lock it waits for.
#[derive(Debug, Clone, PartialEq)]
pub struct LockWaitPair {
    pub blocked: SessionSample,
    pub blocker: SessionSample,
}

/// Where lock-graph samples come from.
pub trait LockGraphSource: Send {
    fn sample(&mut self) -> Result<Vec<LockWaitPair>, CacheError>;
}

/// Cache timing.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub sample_interval: Duration,
    pub cleanup_interval: Duration,
    /// Entries older than this are evicted.
    pub retention: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(10),
            retention: Duration::from_secs(60),
        }
    }
}

struct Shared {
    config: CacheConfig,
    entries: RwLock<HashMap<i32, SessionState>>,
    source: Mutex<Box<dyn LockGraphSource>>,
}

struct Workers {
    stop: CancelToken,
    handles: Vec<JoinHandle<()>>,
}

/// Per-pid transaction timestamps sampled from the lock-wait graph.
pub struct SessionCache {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
}

impl SessionCache {
    pub fn new(source: Box<dyn LockGraphSource>, config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                entries: RwLock::new(HashMap::new()),
                source: Mutex::new(source),
            }),
            workers: Mutex::new(None),
        }
    }

    /// Starts the sampler and cleanup threads. Calling it again while
    /// running is a no-op. Threads also exit when `parent` is cancelled.
    pub fn start(&self, parent: &CancelToken) {
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };
        if workers.is_some() {
            return;
        }

        let stop = CancelToken::new();
        let sampler = {
            let shared = Arc::clone(&self.shared);
            let stop = stop.clone();
            let parent = parent.clone();
            std::thread::spawn(move || sampler_loop(&shared, &stop, &parent))
        };
        let cleaner = {
            let shared = Arc::clone(&self.shared);
            let stop = stop.clone();
            let parent = parent.clone();
            std::thread::spawn(move || cleanup_loop(&shared, &stop, &parent))
        };

        *workers = Some(Workers {
            stop,
            handles: vec![sampler, cleaner],
        });
        info!(
            sample_ms = self.shared.config.sample_interval.as_millis() as u64,
            retention_s = self.shared.config.retention.as_secs(),
            "session cache started"
        );
    }

    /// Stops and joins the background threads. No-op if not running.
    pub fn stop(&self) {
        let taken = match self.workers.lock() {
            Ok(mut w) => w.take(),
            Err(_) => None,
        };
        let Some(workers) = taken else {
            return;
        };
        workers.stop.cancel();
        for handle in workers.handles {
            if handle.join().is_err() {
                warn!("session cache worker panicked");
            }
        }
        info!("session cache stopped");
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Latest snapshot for `pid`, if one is still retained.
    pub fn get(&self, pid: i32) -> Option<SessionState> {
        self.shared.entries.read().ok()?.get(&pid).cloned()
    }

    pub fn insert(&self, state: SessionState) {
        if let Ok(mut entries) = self.shared.entries.write() {
            entries.insert(state.pid, state);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes one lock-graph sample and upserts both sides of every pair.
    /// Returns the number of pairs seen.
    pub fn sample_once(&self) -> Result<usize, CacheError> {
        self.shared.sample_once()
    }

    /// Evicts entries older than the retention window. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        self.shared.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        self.shared.cleanup_at(now)
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn sample_once(&self) -> Result<usize, CacheError> {
        let pairs = {
            let mut source = self.source.lock().map_err(|_| CacheError::Poisoned)?;
            source.sample()?
        };

        let now = Utc::now();
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        for pair in &pairs {
            for side in [&pair.blocked, &pair.blocker] {
                entries.insert(
                    side.pid,
                    SessionState {
                        pid: side.pid,
                        backend_start: side.backend_start,
                        xact_start: side.xact_start,
                        captured_at: now,
                    },
                );
            }
        }
        Ok(pairs.len())
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = now - retention;

        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, s| s.captured_at >= cutoff);
        before - entries.len()
    }
}

fn sampler_loop(shared: &Shared, stop: &CancelToken, parent: &CancelToken) {
    let mut failing = false;
    while !stop.is_cancelled() && !parent.is_cancelled() {
        match shared.sample_once() {
            Ok(pairs) => {
                if failing {
                    info!("lock graph sampling recovered");
                    failing = false;
                }
                if pairs > 0 {
                    debug!(pairs, "lock graph sampled");
                }
            }
            Err(e) => {
                // Only log transitions; the loop keeps retrying.
                if !failing {
                    warn!(error = %e, "lock graph sampling failed");
                    failing = true;
                }
            }
        }
        if !sleep_until_stopped(stop, parent, shared.config.sample_interval) {
            break;
        }
    }
}

fn cleanup_loop(shared: &Shared, stop: &CancelToken, parent: &CancelToken) {
    while sleep_until_stopped(stop, parent, shared.config.cleanup_interval) {
        let removed = shared.cleanup_at(Utc::now());
        if removed > 0 {
            debug!(removed, "session cache entries expired");
        }
    }
}

/// Sleeps in slices, watching both tokens. `false` means stop.
fn sleep_until_stopped(stop: &CancelToken, parent: &CancelToken, total: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let mut left = total;
    while !left.is_zero() {
        if stop.is_cancelled() || parent.is_cancelled() {
            return false;
        }
        let step = left.min(SLICE);
        std::thread::sleep(step);
        left -= step;
    }
    !stop.is_cancelled() && !parent.is_cancelled()
}
