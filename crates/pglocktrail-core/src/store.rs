//! Persistence boundary for deadlock events and file checkpoints.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! embedding, and [`JsonFileStore`], an append-only JSON-lines event log
//! with an atomically replaced checkpoint file.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{Checkpoints, DeadlockEvent};

/// Receives events and keeps checkpoints per tailer key.
pub trait EventStore: Send + Sync {
    /// Persists one event and returns its id.
    fn insert_event(&self, event: &DeadlockEvent) -> Result<i64, StoreError>;

    /// Checkpoints saved under `key`; empty if none.
    fn checkpoints(&self, key: &str) -> Result<Checkpoints, StoreError>;

    /// Replaces the checkpoints saved under `key`.
    fn save_checkpoints(&self, key: &str, checkpoints: &Checkpoints) -> Result<(), StoreError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<DeadlockEvent>>,
    checkpoints: Mutex<HashMap<String, Checkpoints>>,
    fail_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events inserted so far, in insertion order.
    pub fn events(&self) -> Vec<DeadlockEvent> {
        lock(&self.events).clone()
    }

    pub fn event_count(&self) -> usize {
        lock(&self.events).len()
    }

    /// Makes subsequent inserts fail (for exercising error paths).
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

impl EventStore for MemoryStore {
    fn insert_event(&self, event: &DeadlockEvent) -> Result<i64, StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("inserts disabled".into()));
        }
        let mut events = lock(&self.events);
        events.push(event.clone());
        Ok(events.len() as i64)
    }

    fn checkpoints(&self, key: &str) -> Result<Checkpoints, StoreError> {
        Ok(lock(&self.checkpoints).get(key).cloned().unwrap_or_default())
    }

    fn save_checkpoints(&self, key: &str, checkpoints: &Checkpoints) -> Result<(), StoreError> {
        lock(&self.checkpoints).insert(key.to_string(), checkpoints.clone());
        Ok(())
    }
}

const EVENTS_FILE: &str = "deadlocks.jsonl";
const CHECKPOINTS_FILE: &str = "checkpoints.json";

/// One line of `deadlocks.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: DeadlockEvent,
}

/// On-disk checkpoint layout: tailer key → path → offset.
type CheckpointFile = BTreeMap<String, BTreeMap<String, u64>>;

struct FileState {
    events: File,
    next_id: i64,
}

/// Directory-backed store.
///
/// `deadlocks.jsonl` is append-only; `checkpoints.json` is rewritten through
/// a `.tmp` file and renamed into place.
pub struct JsonFileStore {
    dir: PathBuf,
    state: Mutex<FileState>,
}

impl JsonFileStore {
    /// Opens (creating if needed) the store in `dir`.
    ///
    /// Leftover `.tmp` files are removed, and a torn last line in the event
    /// log is truncated.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().extension().is_some_and(|ext| ext == "tmp") {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }

        let events_path = dir.join(EVENTS_FILE);
        let (valid_end, last_id) = recover_event_log(&events_path)?;

        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&events_path)?;
        let len = events.metadata()?.len();
        if valid_end < len {
            warn!(
                path = %events_path.display(),
                garbage_bytes = len - valid_end,
                "truncating torn event log tail"
            );
            events.set_len(valid_end)?;
        }

        Ok(Self {
            dir,
            state: Mutex::new(FileState {
                events,
                next_id: last_id + 1,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads back every stored event.
    pub fn load_events(&self) -> Result<Vec<StoredEvent>, StoreError> {
        let _guard = lock(&self.state);
        let file = match File::open(self.dir.join(EVENTS_FILE)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    fn read_checkpoint_file(&self) -> Result<CheckpointFile, StoreError> {
        match fs::read(self.dir.join(CHECKPOINTS_FILE)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckpointFile::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Returns the byte length of the valid prefix of the event log and the
/// highest id in it.
fn recover_event_log(path: &Path) -> Result<(u64, i64), StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut valid_end = 0u64;
    let mut last_id = 0i64;
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 || buf.last() != Some(&b'\n') {
            break;
        }
        match serde_json::from_slice::<StoredEvent>(&buf) {
            Ok(stored) => last_id = last_id.max(stored.id),
            Err(_) => break,
        }
        valid_end += n as u64;
    }
    debug!(path = %path.display(), last_id, "event log recovered");
    Ok((valid_end, last_id))
}

impl EventStore for JsonFileStore {
    fn insert_event(&self, event: &DeadlockEvent) -> Result<i64, StoreError> {
        let mut state = lock(&self.state);
        let stored = StoredEvent {
            id: state.next_id,
            event: event.clone(),
        };
        let mut line = serde_json::to_vec(&stored)?;
        line.push(b'\n');
        state.events.write_all(&line)?;
        state.events.flush()?;
        state.next_id += 1;
        Ok(stored.id)
    }

    fn checkpoints(&self, key: &str) -> Result<Checkpoints, StoreError> {
        let _guard = lock(&self.state);
        let file = self.read_checkpoint_file()?;
        Ok(file
            .get(key)
            .map(|m| {
                m.iter()
                    .map(|(path, offset)| (PathBuf::from(path), *offset))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn save_checkpoints(&self, key: &str, checkpoints: &Checkpoints) -> Result<(), StoreError> {
        let _guard = lock(&self.state);
        let mut file = self.read_checkpoint_file()?;
        file.insert(
            key.to_string(),
            checkpoints
                .iter()
                .map(|(path, offset)| (path.to_string_lossy().into_owned(), *offset))
                .collect(),
        );

        let path = self.dir.join(CHECKPOINTS_FILE);
        let tmp_path = path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&serde_json::to_vec_pretty(&file)?)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(tmp_path, path)?;
        Ok(())
    }
}
