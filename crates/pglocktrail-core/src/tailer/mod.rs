//! Incremental deadlock extraction from PostgreSQL log files.
//!
//! A tailer re-scans every file matching its directory and glob, starting
//! at the byte offset where the previous scan stopped. The three log
//! encodings share one scan engine ([`LogTailer`]); only the record
//! assembly differs ([`RecordAssembler`]).
//!
//! Per file the engine:
//! - opens at the checkpoint (from zero after truncation),
//! - feeds every line to a fresh assembler,
//! - resolves finished reports into events and persists them in order,
//! - advances the checkpoint to the end of what was read.
//!
//! A cancelled scan or a read error leaves that file's checkpoint and
//! events untouched, so the next scan repeats it from the same offset.

mod csv;
mod grammar;
mod json;
mod stderr;

use std::io::BufRead;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{StoreError, TailError};
use crate::model::Checkpoints;
use crate::session_cache::SessionCache;
use crate::source::{LogFileSource, LogFormat};
use crate::store::EventStore;

pub use csv::CsvAssembler;
pub use grammar::EventDraft;
pub use json::JsonAssembler;
pub use stderr::StderrAssembler;

use grammar::EventEnv;

/// Uniform contract of every format-specific tailer.
pub trait DeadlockTailer: Send + Sync {
    /// Encoding this tailer understands.
    fn format(&self) -> LogFormat;

    /// Store key for this tailer's checkpoints.
    fn key(&self) -> &'static str {
        self.format().as_str()
    }

    /// Scans all matching files for new events. Returns how many were persisted.
    fn scan(&self, cancel: &CancelToken) -> Result<usize, TailError> {
        self.scan_with_progress(cancel, &mut |_, _| {})
    }

    /// Like [`scan`](Self::scan), calling `progress(files_done, files_total)`
    /// once per file.
    fn scan_with_progress(
        &self,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<usize, TailError>;

    fn checkpoints(&self) -> Checkpoints;

    /// Merges `checkpoints` into the current ones.
    fn set_checkpoints(&self, checkpoints: &Checkpoints);

    fn reset_checkpoints(&self);

    /// Tags events discovered from now on.
    fn set_instance_name(&self, name: &str);
}

/// Turns physical log lines into deadlock report drafts.
///
/// A fresh assembler is used for every file; state never crosses files.
pub trait RecordAssembler: Default + Send {
    const FORMAT: LogFormat;

    /// Feeds one line without its terminator. Completed reports go to `out`.
    fn push_line(&mut self, line: &str, out: &mut Vec<EventDraft>);

    /// Flushes whatever is still open at end of input.
    fn finish(&mut self, out: &mut Vec<EventDraft>);

    /// Records that could not be decoded so far.
    fn malformed(&self) -> usize;
}

/// What to tail.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub directory: PathBuf,
    /// File glob relative to `directory`.
    pub pattern: String,
    /// Used when the log record does not name a database.
    pub database_name: String,
}

impl TailerConfig {
    pub fn new(
        directory: impl Into<PathBuf>,
        pattern: impl Into<String>,
        database_name: impl Into<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            pattern: pattern.into(),
            database_name: database_name.into(),
        }
    }
}

#[derive(Default)]
struct TailState {
    checkpoints: Checkpoints,
    instance_name: String,
}

/// Outcome of reading one file to its end.
struct FileScan {
    drafts: Vec<EventDraft>,
    end: u64,
    malformed: usize,
}

/// Scan engine shared by all encodings.
pub struct LogTailer<A: RecordAssembler> {
    config: TailerConfig,
    source: Arc<dyn LogFileSource>,
    store: Arc<dyn EventStore>,
    session_cache: Option<Arc<SessionCache>>,
    /// Serializes scans and guards checkpoints.
    state: Mutex<TailState>,
    _assembler: PhantomData<fn() -> A>,
}

pub type StderrTailer = LogTailer<StderrAssembler>;
pub type CsvTailer = LogTailer<CsvAssembler>;
pub type JsonTailer = LogTailer<JsonAssembler>;

impl<A: RecordAssembler> LogTailer<A> {
    pub fn new(
        config: TailerConfig,
        source: Arc<dyn LogFileSource>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            session_cache: None,
            state: Mutex::new(TailState::default()),
            _assembler: PhantomData,
        }
    }

    pub fn with_session_cache(mut self, cache: Arc<SessionCache>) -> Self {
        self.session_cache = Some(cache);
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, TailState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_file(
        &self,
        path: &Path,
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<FileScan, TailError> {
        let open_err = |source| TailError::Open {
            path: path.to_path_buf(),
            source,
        };

        let opened = self.source.open_at(path, offset).map_err(open_err)?;
        if opened.start != offset {
            debug!(
                path = %path.display(),
                checkpoint = offset,
                len = opened.len,
                "file shrank below checkpoint, reading from start"
            );
        }

        let mut reader = opened.reader;
        let mut pos = opened.start;
        let mut assembler = A::default();
        let mut drafts = Vec::new();
        let mut buf = Vec::with_capacity(4096);

        loop {
            if cancel.is_cancelled() {
                return Err(TailError::Cancelled);
            }
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).map_err(open_err)?;
            // An unterminated last line may still be in flight.
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            pos += n as u64;

            let text = String::from_utf8_lossy(&buf);
            let line = text.strip_suffix('\n').unwrap_or(&text);
            let line = line.strip_suffix('\r').unwrap_or(line);
            assembler.push_line(line, &mut drafts);
        }
        assembler.finish(&mut drafts);

        Ok(FileScan {
            drafts,
            end: pos,
            malformed: assembler.malformed(),
        })
    }
}

impl<A: RecordAssembler> DeadlockTailer for LogTailer<A> {
    fn format(&self) -> LogFormat {
        A::FORMAT
    }

    fn scan_with_progress(
        &self,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<usize, TailError> {
        let mut state = self.lock_state();

        let files = self
            .source
            .list(&self.config.directory, &self.config.pattern)
            .map_err(|source| TailError::Glob {
                pattern: self
                    .config
                    .directory
                    .join(&self.config.pattern)
                    .display()
                    .to_string(),
                source,
            })?;

        let total = files.len();
        let mut persisted = 0usize;
        let mut failed = 0usize;
        let mut first_store_error: Option<StoreError> = None;
        let mut malformed = 0usize;

        for (i, path) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(TailError::Cancelled);
            }

            let offset = state.checkpoints.get(path).copied().unwrap_or(0);
            let scan = match self.read_file(path, offset, cancel) {
                Ok(scan) => scan,
                Err(TailError::Cancelled) => {
                    debug!(path = %path.display(), "scan cancelled mid-file");
                    return Err(TailError::Cancelled);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping log file");
                    progress(i + 1, total);
                    continue;
                }
            };
            malformed += scan.malformed;

            if !scan.drafts.is_empty()
                && self.session_cache.as_deref().is_some_and(SessionCache::is_empty)
            {
                debug!(path = %path.display(), "session cache empty, timings come from the log only");
            }
            let env = EventEnv {
                database_name: &self.config.database_name,
                instance_name: &state.instance_name,
                session_cache: self.session_cache.as_deref(),
            };
            for draft in scan.drafts {
                let Some(event) = draft.into_event(&env) else {
                    continue;
                };
                match self.store.insert_event(&event) {
                    Ok(id) => {
                        persisted += 1;
                        debug!(
                            id,
                            resolved_by_pid = ?event.resolved_by_pid,
                            processes = event.processes.len(),
                            relations = ?event.relations(),
                            "deadlock event stored"
                        );
                    }
                    Err(e) => {
                        failed += 1;
                        warn!(path = %path.display(), error = %e, "failed to store deadlock event");
                        first_store_error.get_or_insert(e);
                    }
                }
            }

            state.checkpoints.insert(path.clone(), scan.end);
            progress(i + 1, total);
        }

        if malformed > 0 {
            warn!(count = malformed, format = %A::FORMAT, "skipped malformed log records");
        }
        if persisted > 0 {
            info!(count = persisted, format = %A::FORMAT, "new deadlock events");
        }

        match first_store_error {
            Some(source) => Err(TailError::Store {
                persisted,
                failed,
                source,
            }),
            None => Ok(persisted),
        }
    }

    fn checkpoints(&self) -> Checkpoints {
        self.lock_state().checkpoints.clone()
    }

    fn set_checkpoints(&self, checkpoints: &Checkpoints) {
        let mut state = self.lock_state();
        for (path, offset) in checkpoints {
            state.checkpoints.insert(path.clone(), *offset);
        }
    }

    fn reset_checkpoints(&self) {
        self.lock_state().checkpoints.clear();
    }

    fn set_instance_name(&self, name: &str) {
        self.lock_state().instance_name = name.to_string();
    }
}

/// Builds the tailer for `format`.
pub fn new_tailer(
    format: LogFormat,
    config: TailerConfig,
    source: Arc<dyn LogFileSource>,
    store: Arc<dyn EventStore>,
    session_cache: Option<Arc<SessionCache>>,
) -> Box<dyn DeadlockTailer> {
    fn build<A: RecordAssembler + 'static>(
        config: TailerConfig,
        source: Arc<dyn LogFileSource>,
        store: Arc<dyn EventStore>,
        session_cache: Option<Arc<SessionCache>>,
    ) -> Box<dyn DeadlockTailer> {
        let tailer = LogTailer::<A>::new(config, source, store);
        match session_cache {
            Some(cache) => Box::new(tailer.with_session_cache(cache)),
            None => Box::new(tailer),
        }
    }

    match format {
        LogFormat::Stderr => build::<StderrAssembler>(config, source, store, session_cache),
        LogFormat::Csv => build::<CsvAssembler>(config, source, store, session_cache),
        LogFormat::Json => build::<JsonAssembler>(config, source, store, session_cache),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeadlockEvent;
    use crate::source::FsLogSource;
    use crate::store::MemoryStore;
    use std::io::Write;

    const STDERR_DEADLOCK: &str = "\
2025-11-23 00:15:52.554 UTC [83853] [psql] [alice@10.0.0.5] ERROR:  deadlock detected
2025-11-23 00:15:52.554 UTC [83853] [psql] [alice@10.0.0.5] DETAIL:  Process 83853 waits for ShareLock on transaction 4370; blocked by process 83850.
\tProcess 83850 waits for ShareLock on transaction 4371; blocked by process 83853.
\tProcess 83853: UPDATE accounts SET balance = 1 WHERE id = 1;
\tProcess 83850: UPDATE accounts SET balance = 2 WHERE id = 2;
2025-11-23 00:15:52.554 UTC [83853] [psql] [alice@10.0.0.5] HINT:  See server log for query details.
2025-11-23 00:15:52.554 UTC [83853] [psql] [alice@10.0.0.5] CONTEXT:  while updating tuple (0,1) in relation \"accounts\"
2025-11-23 00:15:52.554 UTC [83853] [psql] [alice@10.0.0.5] STATEMENT:  UPDATE accounts SET balance = 1 WHERE id = 1;
";

    const STDERR_OTHER: &str =
        "2025-11-23 00:16:00.000 UTC [99] [app] LOG:  checkpoint starting: time\n";

    const JSON_DEADLOCK: &str = r#"{"timestamp":"2025-11-23 00:15:52.554 UTC","user":"alice","dbname":"app","pid":83853,"remote_host":"10.0.0.5","error_severity":"ERROR","message":"deadlock detected","detail":"Process 83853 waits for ShareLock on transaction 4370; blocked by process 83850.\nProcess 83850 waits for ShareLock on transaction 4371; blocked by process 83853.\nProcess 83853: UPDATE accounts SET balance = 1 WHERE id = 1;\nProcess 83850: UPDATE accounts SET balance = 2 WHERE id = 2;","context":"while updating tuple (0,1) in relation \"accounts\"","application_name":"psql"}
"#;

    const CSV_DEADLOCK: &str = "2025-11-23 00:15:52.554 UTC,\"alice\",\"app\",83853,\"10.0.0.5:51234\",6560a1b0.147ad,3,\"UPDATE\",,3/27,4371,ERROR,40P01,\"deadlock detected\",\"Process 83853 waits for ShareLock on transaction 4370; blocked by process 83850.
Process 83850 waits for ShareLock on transaction 4371; blocked by process 83853.
Process 83853: UPDATE accounts SET balance = 1 WHERE id = 1;
Process 83850: UPDATE accounts SET balance = 2 WHERE id = 2;\",\"See server log for query details.\",,,\"while updating tuple (0,1) in relation \"\"accounts\"\"\",,,,\"psql\",client backend,,0
";

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn append(&self, name: &str, content: &str) {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(self.dir.path().join(name))
                .unwrap();
            f.write_all(content.as_bytes()).unwrap();
        }

        fn tailer(&self, format: LogFormat, pattern: &str) -> Box<dyn DeadlockTailer> {
            new_tailer(
                format,
                TailerConfig::new(self.dir.path(), pattern, "app"),
                Arc::new(FsLogSource::new()),
                self.store.clone(),
                None,
            )
        }
    }

    /// Fields that must not depend on the log encoding.
    fn essence(event: &DeadlockEvent) -> Vec<(i32, String, String, String, Option<i32>, String)> {
        event
            .processes
            .iter()
            .map(|p| {
                (
                    p.pid,
                    p.lock_mode.clone(),
                    p.lock_type.clone(),
                    p.relation_name.clone(),
                    p.blocked_by_pid,
                    p.query.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let fx = Fixture::new();
        fx.write("postgresql-1.log", STDERR_DEADLOCK);
        let tailer = fx.tailer(LogFormat::Stderr, "postgresql-*.log");
        let cancel = CancelToken::new();

        assert_eq!(tailer.scan(&cancel).unwrap(), 1);
        assert_eq!(tailer.scan(&cancel).unwrap(), 0);
        assert_eq!(fx.store.event_count(), 1);
    }

    #[test]
    fn test_checkpoints_follow_file_growth() {
        let fx = Fixture::new();
        let path = fx.write("postgresql-1.log", STDERR_DEADLOCK);
        let tailer = fx.tailer(LogFormat::Stderr, "postgresql-*.log");
        let cancel = CancelToken::new();

        tailer.scan(&cancel).unwrap();
        let first = tailer.checkpoints()[&path];
        assert_eq!(first, std::fs::metadata(&path).unwrap().len());

        fx.append("postgresql-1.log", STDERR_OTHER);
        fx.append("postgresql-1.log", STDERR_DEADLOCK);
        assert_eq!(tailer.scan(&cancel).unwrap(), 1);
        let second = tailer.checkpoints()[&path];
        assert!(second > first);
        assert_eq!(second, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_unterminated_line_left_for_next_scan() {
        let fx = Fixture::new();
        let (head, tail) = STDERR_DEADLOCK.split_at(STDERR_DEADLOCK.len() - 20);
        let path = fx.write("pg.log", head);
        let tailer = fx.tailer(LogFormat::Stderr, "*.log");
        let cancel = CancelToken::new();

        tailer.scan(&cancel).unwrap();
        let partial_end = head.rfind('\n').unwrap() as u64 + 1;
        assert_eq!(tailer.checkpoints()[&path], partial_end);

        fx.append("pg.log", tail);
        tailer.scan(&cancel).unwrap();
        assert_eq!(tailer.checkpoints()[&path], STDERR_DEADLOCK.len() as u64);
        assert_eq!(fx.store.event_count(), 1);
    }

    #[test]
    fn test_truncated_file_rescanned_from_start() {
        let fx = Fixture::new();
        fx.write("postgresql-1.log", &format!("{STDERR_OTHER}{STDERR_OTHER}{STDERR_DEADLOCK}"));
        let tailer = fx.tailer(LogFormat::Stderr, "postgresql-*.log");
        let cancel = CancelToken::new();
        assert_eq!(tailer.scan(&cancel).unwrap(), 1);

        fx.write("postgresql-1.log", STDERR_DEADLOCK);
        assert_eq!(tailer.scan(&cancel).unwrap(), 1);
        assert_eq!(fx.store.event_count(), 2);
    }

    #[test]
    fn test_formats_produce_equivalent_events() {
        let cancel = CancelToken::new();
        let mut results = Vec::new();
        for (format, name, content) in [
            (LogFormat::Stderr, "pg.log", STDERR_DEADLOCK),
            (LogFormat::Json, "pg.json", JSON_DEADLOCK),
            (LogFormat::Csv, "pg.csv", CSV_DEADLOCK),
        ] {
            let fx = Fixture::new();
            fx.write(name, content);
            let tailer = fx.tailer(format, name);
            assert_eq!(tailer.scan(&cancel).unwrap(), 1, "{format}");
            results.push(fx.store.events().remove(0));
        }

        let reference = essence(&results[0]);
        assert_eq!(reference.len(), 2);
        for event in &results {
            assert_eq!(essence(event), reference);
            assert_eq!(event.resolved_by_pid, Some(83853));
            assert_eq!(event.database_name, "app");
            assert_eq!(event.processes[0].username, "alice");
            assert_eq!(event.processes[0].application_name, "psql");
            assert_eq!(event.processes[0].client_addr, "10.0.0.5");
            assert_eq!(
                event.processes[0].query_fingerprint,
                results[0].processes[0].query_fingerprint
            );
        }
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let fx = Fixture::new();
        let mut content = String::from(JSON_DEADLOCK);
        for i in 0..50 {
            content.push_str(&format!("garbage line {i} {{ not json\n"));
        }
        content.push_str(JSON_DEADLOCK);
        fx.write("pg.json", &content);

        let tailer = fx.tailer(LogFormat::Json, "*.json");
        assert_eq!(tailer.scan(&CancelToken::new()).unwrap(), 2);
    }

    #[test]
    fn test_stderr_garbage_between_reports() {
        let fx = Fixture::new();
        let mut content = String::from(STDERR_DEADLOCK);
        content.push_str(STDERR_OTHER);
        for _ in 0..50 {
            content.push_str("\u{1}\u{2} binary noise \u{7f}\n");
        }
        content.push_str(STDERR_DEADLOCK);
        fx.write("pg.log", &content);

        let tailer = fx.tailer(LogFormat::Stderr, "*.log");
        assert_eq!(tailer.scan(&CancelToken::new()).unwrap(), 2);
    }

    #[test]
    fn test_report_without_processes_not_stored() {
        let fx = Fixture::new();
        fx.write(
            "pg.log",
            "2025-11-23 00:15:52 UTC [1] [app] ERROR:  deadlock detected\n\
             2025-11-23 00:15:53 UTC [2] [app] LOG:  unrelated\n",
        );
        let tailer = fx.tailer(LogFormat::Stderr, "*.log");
        assert_eq!(tailer.scan(&CancelToken::new()).unwrap(), 0);
        assert_eq!(fx.store.event_count(), 0);
    }

    #[test]
    fn test_relation_fallback_from_context() {
        let fx = Fixture::new();
        let log = STDERR_DEADLOCK
            .replace(
                "Process 83853: UPDATE accounts SET balance = 1 WHERE id = 1;",
                "Process 83853: SELECT transfer(1, 2);",
            )
            .replace(
                "Process 83850: UPDATE accounts SET balance = 2 WHERE id = 2;",
                "Process 83850: not parseable sql",
            );
        fx.write("pg.log", &log);
        let tailer = fx.tailer(LogFormat::Stderr, "*.log");
        tailer.scan(&CancelToken::new()).unwrap();

        let event = &fx.store.events()[0];
        assert_eq!(event.processes[0].relation_name, "accounts");
        assert_eq!(event.processes[1].relation_name, "accounts");
        assert!(event.processes[0].query_fingerprint.is_some());
        assert_eq!(event.processes[1].query_fingerprint, None);
    }

    #[test]
    fn test_highest_param_number_in_query() {
        let fx = Fixture::new();
        let log = STDERR_DEADLOCK.replace(
            "Process 83850: UPDATE accounts SET balance = 2 WHERE id = 2;",
            "Process 83850: UPDATE accounts SET balance = 2 WHERE id = $4294967295;",
        );
        fx.write("pg.log", &log);
        let tailer = fx.tailer(LogFormat::Stderr, "*.log");
        assert_eq!(tailer.scan(&CancelToken::new()).unwrap(), 1);

        let event = &fx.store.events()[0];
        assert_eq!(event.processes[1].relation_name, "accounts");
        assert!(event.processes[1].query_fingerprint.is_some());
    }

    #[test]
    fn test_relation_empty_without_fallback() {
        let fx = Fixture::new();
        let log = STDERR_DEADLOCK
            .replace(
                "Process 83853: UPDATE accounts SET balance = 1 WHERE id = 1;",
                "Process 83853: SELECT transfer(1, 2);",
            )
            .replace("in relation \"accounts\"", "at SQL statement");
        fx.write("pg.log", &log);
        let tailer = fx.tailer(LogFormat::Stderr, "*.log");
        tailer.scan(&CancelToken::new()).unwrap();

        let event = &fx.store.events()[0];
        assert_eq!(event.processes[0].relation_name, "");
        assert_eq!(event.processes[1].relation_name, "accounts");
    }

    #[test]
    fn test_cancelled_scan_keeps_checkpoint() {
        let fx = Fixture::new();
        fx.write("pg.log", STDERR_DEADLOCK);
        let tailer = fx.tailer(LogFormat::Stderr, "*.log");

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(tailer.scan(&cancel), Err(TailError::Cancelled)));
        assert!(tailer.checkpoints().is_empty());
        assert_eq!(fx.store.event_count(), 0);

        assert_eq!(tailer.scan(&CancelToken::new()).unwrap(), 1);
    }

    #[test]
    fn test_store_failure_reported_and_checkpoint_advanced() {
        let fx = Fixture::new();
        let path = fx.write("pg.log", &format!("{STDERR_DEADLOCK}{STDERR_DEADLOCK}"));
        let tailer = fx.tailer(LogFormat::Stderr, "*.log");

        fx.store.set_fail_inserts(true);
        match tailer.scan(&CancelToken::new()) {
            Err(TailError::Store {
                persisted, failed, ..
            }) => {
                assert_eq!(persisted, 0);
                assert_eq!(failed, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(
            tailer.checkpoints()[&path],
            std::fs::metadata(&path).unwrap().len()
        );
    }

    #[test]
    fn test_progress_reported_per_file() {
        let fx = Fixture::new();
        fx.write("pg-1.log", STDERR_DEADLOCK);
        fx.write("pg-2.log", STDERR_OTHER);
        fx.write("pg-3.log", "");
        let tailer = fx.tailer(LogFormat::Stderr, "pg-*.log");

        let mut calls = Vec::new();
        tailer
            .scan_with_progress(&CancelToken::new(), &mut |done, total| {
                calls.push((done, total))
            })
            .unwrap();
        assert_eq!(calls, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn test_set_checkpoints_merges() {
        let fx = Fixture::new();
        let tailer = fx.tailer(LogFormat::Stderr, "*.log");
        let mut a = Checkpoints::new();
        a.insert(PathBuf::from("/a"), 1);
        tailer.set_checkpoints(&a);
        let mut b = Checkpoints::new();
        b.insert(PathBuf::from("/b"), 2);
        tailer.set_checkpoints(&b);
        assert_eq!(tailer.checkpoints().len(), 2);

        tailer.reset_checkpoints();
        assert!(tailer.checkpoints().is_empty());
    }

    #[test]
    fn test_instance_name_tags_events() {
        let fx = Fixture::new();
        fx.write("pg.log", STDERR_DEADLOCK);
        let tailer = fx.tailer(LogFormat::Stderr, "*.log");
        tailer.set_instance_name("replica-2");
        tailer.scan(&CancelToken::new()).unwrap();
        assert_eq!(fx.store.events()[0].instance_name, "replica-2");
    }

    #[test]
    fn test_invalid_pattern_is_glob_error() {
        let fx = Fixture::new();
        let tailer = fx.tailer(LogFormat::Stderr, "[bad");
        assert!(matches!(
            tailer.scan(&CancelToken::new()),
            Err(TailError::Glob { .. })
        ));
    }

    #[test]
    fn test_selector_formats() {
        let fx = Fixture::new();
        assert_eq!(fx.tailer(LogFormat::Json, "*").format(), LogFormat::Json);
        assert_eq!(fx.tailer(LogFormat::Csv, "*").key(), "csvlog");
        assert_eq!(fx.tailer(LogFormat::Stderr, "*").key(), "stderr");
    }
}
