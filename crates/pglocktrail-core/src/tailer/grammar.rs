//! Deadlock report grammar shared by all encodings.
//!
//! PostgreSQL reports a deadlock as one ERROR whose DETAIL lists every
//! participant twice: once as a wait-for edge and once with its query.
//!
//! ```text
//! ERROR:  deadlock detected
//! DETAIL:  Process 83853 waits for ShareLock on transaction 4370; blocked by process 83850.
//!         Process 83850 waits for ShareLock on transaction 4371; blocked by process 83853.
//!         Process 83853: UPDATE t SET v = 1 WHERE id = 1;
//!         Process 83850: UPDATE t SET v = 2 WHERE id = 2;
//! CONTEXT:  while updating tuple (0,1) in relation "t"
//! ```
//!
//! [`EventDraft`] collects those lines in any order and resolves them into
//! a [`DeadlockEvent`] once the report is complete.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::fingerprint::{extract_relation, fingerprint_strict};
use crate::model::{DeadlockEvent, DeadlockProcess};
use crate::session_cache::SessionCache;
use crate::time::parse_log_timestamp;

/// Leading `%m`/`%t` timestamp including fraction and zone.
pub(crate) static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?(?:\s*(?:[A-Za-z]{1,5}|[+-]\d{2}(?::?\d{2})?))?)(?:\s|\[|$)",
    )
    .unwrap()
});

static LOG_PID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(\d+)\]").unwrap());

/// `[pid] [app]` optionally followed by `[user@host]`.
static LOG_METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\d+\]\s*\[([^\]]*)\](?:\s*\[(\w+)@(\[local\]|[^\]]+)\])?").unwrap()
});

static PROCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Process (\d+): (.+)").unwrap());

static RELATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"relation "([^"]+)""#).unwrap());

static DETECTION_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"detected deadlock.*after ([\d.]+) ms").unwrap());

static WAITS_FOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Process (\d+) waits for (\w+) on (\w+).+; blocked by process (\d+)").unwrap()
});

/// Message fragment identifying the deadlock ERROR.
pub(crate) const DEADLOCK_MESSAGE: &str = "deadlock detected";

/// One `Process A waits for MODE on TYPE ...; blocked by process B` edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WaitFor {
    pub lock_mode: String,
    pub lock_type: String,
    pub blocked_by: i32,
}

pub(crate) fn parse_waits_for(line: &str) -> Option<(i32, WaitFor)> {
    let caps = WAITS_FOR_RE.captures(line)?;
    let pid = caps[1].parse().ok()?;
    Some((
        pid,
        WaitFor {
            lock_mode: caps[2].to_string(),
            lock_type: caps[3].to_string(),
            blocked_by: caps[4].parse().ok()?,
        },
    ))
}

/// `Process PID: QUERY` with the query trimmed.
pub(crate) fn parse_process_line(line: &str) -> Option<(i32, String)> {
    let caps = PROCESS_RE.captures(line)?;
    let pid = caps[1].parse().ok()?;
    Some((pid, caps[2].trim().to_string()))
}

/// `relation "NAME"` from a CONTEXT message.
pub(crate) fn extract_context_relation(text: &str) -> Option<String> {
    RELATION_RE.captures(text).map(|c| c[1].to_string())
}

/// Whole milliseconds from `... detected deadlock ... after N ms`.
pub(crate) fn extract_detection_time(text: &str) -> Option<u64> {
    let caps = DETECTION_TIME_RE.captures(text)?;
    let ms: f64 = caps[1].parse().ok()?;
    (ms.is_finite() && ms >= 0.0).then_some(ms as u64)
}

/// First bracketed number on a prefixed line (`%p` in `[%p]`).
pub(crate) fn extract_log_pid(line: &str) -> Option<i32> {
    LOG_PID_RE.captures(line)?[1].parse().ok()
}

pub(crate) fn extract_log_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let caps = TIMESTAMP_RE.captures(line)?;
    parse_log_timestamp(&caps[1])
}

/// Identity fields shared by every process of one report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LogMetadata {
    pub application_name: String,
    pub username: String,
    pub client_addr: String,
}

/// Identity from a stderr prefix (`[pid] [app]` or `[pid] [app] [user@host]`).
pub(crate) fn extract_log_metadata(line: &str) -> Option<LogMetadata> {
    let caps = LOG_METADATA_RE.captures(line)?;
    let mut meta = LogMetadata {
        application_name: caps[1].to_string(),
        ..Default::default()
    };
    if let (Some(user), Some(host)) = (caps.get(2), caps.get(3)) {
        meta.username = user.as_str().to_string();
        meta.client_addr = normalize_client_addr(host.as_str());
    }
    Some(meta)
}

/// `[local]` and empty addresses mean a Unix-socket connection.
pub(crate) fn normalize_client_addr(addr: &str) -> String {
    if addr.is_empty() || addr == "[local]" {
        "local".to_string()
    } else {
        addr.to_string()
    }
}

/// Scan-wide values applied to every event.
pub(crate) struct EventEnv<'a> {
    pub database_name: &'a str,
    pub instance_name: &'a str,
    pub session_cache: Option<&'a SessionCache>,
}

/// A deadlock report under construction.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub(crate) detected_at: Option<DateTime<Utc>>,
    /// Overrides the configured database name when the record carries one.
    pub(crate) database_name: Option<String>,
    pub(crate) resolved_by_pid: Option<i32>,
    pub(crate) detection_time_ms: Option<u64>,
    pub(crate) metadata: LogMetadata,
    pub(crate) backend_start: Option<DateTime<Utc>>,
    pub(crate) context_relation: Option<String>,
    pub(crate) wait_for: HashMap<i32, WaitFor>,
    pub(crate) processes: Vec<(i32, String)>,
}

impl EventDraft {
    pub(crate) fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Feeds one line of DETAIL text. Indented lines that are neither an
    /// edge nor a process line continue the previous query when
    /// `continuation` is set. Returns `false` if the line was not used.
    pub(crate) fn push_detail_line(&mut self, line: &str, continuation: bool) -> bool {
        if let Some((pid, wait)) = parse_waits_for(line) {
            self.wait_for.insert(pid, wait);
            return true;
        }
        if let Some((pid, query)) = parse_process_line(line) {
            if self.processes.iter().any(|(p, _)| *p == pid) {
                debug!(pid, "duplicate process line in deadlock report");
            } else {
                self.processes.push((pid, query));
            }
            return true;
        }
        if continuation
            && let Some((_, query)) = self.processes.last_mut()
        {
            let extra = line.trim();
            if !extra.is_empty() {
                query.push(' ');
                query.push_str(extra);
                return true;
            }
        }
        false
    }

    /// Feeds a whole DETAIL field (csvlog/jsonlog), one line at a time.
    pub(crate) fn push_detail_text(&mut self, detail: &str) {
        for line in detail.lines() {
            self.push_detail_line(line, true);
        }
    }

    /// Resolves the draft. Returns `None` when no process was reported.
    pub(crate) fn into_event(self, env: &EventEnv<'_>) -> Option<DeadlockEvent> {
        if self.processes.is_empty() {
            debug!(
                resolved_by_pid = ?self.resolved_by_pid,
                "dropping deadlock report without processes"
            );
            return None;
        }

        let EventDraft {
            detected_at,
            database_name,
            resolved_by_pid,
            detection_time_ms,
            metadata,
            backend_start,
            context_relation,
            mut wait_for,
            processes,
        } = self;

        let processes = processes
            .into_iter()
            .map(|(pid, query)| {
                let wait = wait_for.remove(&pid);
                let cached = env.session_cache.and_then(|c| c.get(pid));
                let relation_name = extract_relation(&query)
                    .or_else(|| context_relation.clone())
                    .unwrap_or_default();

                DeadlockProcess {
                    pid,
                    lock_type: wait.as_ref().map(|w| w.lock_type.clone()).unwrap_or_default(),
                    lock_mode: wait.as_ref().map(|w| w.lock_mode.clone()).unwrap_or_default(),
                    blocked_by_pid: wait.map(|w| w.blocked_by),
                    relation_name,
                    query_fingerprint: fingerprint_strict(&query),
                    query,
                    username: metadata.username.clone(),
                    application_name: metadata.application_name.clone(),
                    client_addr: metadata.client_addr.clone(),
                    backend_start: backend_start
                        .filter(|_| Some(pid) == resolved_by_pid)
                        .or_else(|| cached.as_ref().and_then(|s| s.backend_start)),
                    xact_start: cached.and_then(|s| s.xact_start),
                }
            })
            .collect();

        let event = DeadlockEvent {
            detected_at: detected_at.unwrap_or_else(Utc::now),
            database_name: database_name
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| env.database_name.to_string()),
            instance_name: env.instance_name.to_string(),
            resolved_by_pid,
            detection_time_ms,
            processes,
        };

        let dangling = event.dangling_blockers();
        if !dangling.is_empty() {
            debug!(?dangling, "blocked_by_pid outside of the reported cycle");
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionState;
    use crate::session_cache::{CacheConfig, LockGraphSource, LockWaitPair};

    const DETAIL: &str = "Process 83853 waits for ShareLock on transaction 4370; blocked by process 83850.\n\
Process 83850 waits for ShareLock on transaction 4371; blocked by process 83853.\n\
Process 83853: UPDATE accounts SET balance = 1 WHERE id = 1;\n\
Process 83850: UPDATE accounts SET balance = 2 WHERE id = 2;";

    fn env<'a>(cache: Option<&'a SessionCache>) -> EventEnv<'a> {
        EventEnv {
            database_name: "app",
            instance_name: "primary",
            session_cache: cache,
        }
    }

    #[test]
    fn test_parse_waits_for() {
        let (pid, wait) = parse_waits_for(
            "DETAIL:  Process 83853 waits for ShareLock on transaction 4370; blocked by process 83850.",
        )
        .unwrap();
        assert_eq!(pid, 83853);
        assert_eq!(wait.lock_mode, "ShareLock");
        assert_eq!(wait.lock_type, "transaction");
        assert_eq!(wait.blocked_by, 83850);
    }

    #[test]
    fn test_parse_process_line() {
        assert_eq!(
            parse_process_line("\tProcess 79638: UPDATE t SET a = 1;  "),
            Some((79638, "UPDATE t SET a = 1;".to_string()))
        );
        assert_eq!(
            parse_process_line("Process 1 waits for ShareLock on transaction 2"),
            None
        );
    }

    #[test]
    fn test_extract_detection_time() {
        assert_eq!(
            extract_detection_time(
                "LOG:  process 83853 detected deadlock while waiting for ShareLock on transaction 4370 after 1001.189 ms"
            ),
            Some(1001)
        );
        assert_eq!(extract_detection_time("ERROR:  deadlock detected"), None);
    }

    #[test]
    fn test_extract_log_metadata() {
        let line = "2025-11-23 00:15:52.554 PST [79638] [psql] [alice@[local]] ERROR:  deadlock detected";
        let meta = extract_log_metadata(line).unwrap();
        assert_eq!(meta.application_name, "psql");
        assert_eq!(meta.username, "alice");
        assert_eq!(meta.client_addr, "local");

        let meta = extract_log_metadata("2025-11-23 00:15:52 UTC [1] [app] ERROR:  x").unwrap();
        assert_eq!(meta.application_name, "app");
        assert_eq!(meta.username, "");

        assert!(extract_log_metadata("2025-11-23 00:15:52 UTC ERROR:  x").is_none());
    }

    #[test]
    fn test_extract_log_pid_and_timestamp() {
        let line = "2025-11-23 00:15:52.554 UTC [79638] [psql] ERROR:  deadlock detected";
        assert_eq!(extract_log_pid(line), Some(79638));
        let ts = extract_log_timestamp(line).unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-11-23T00:15:52.554+00:00");
        assert!(extract_log_timestamp("\tProcess 1: SELECT 1").is_none());
    }

    #[test]
    fn test_draft_resolves_detail() {
        let mut draft = EventDraft {
            resolved_by_pid: Some(83853),
            ..Default::default()
        };
        draft.push_detail_text(DETAIL);
        let event = draft.into_event(&env(None)).unwrap();

        assert_eq!(event.database_name, "app");
        assert_eq!(event.instance_name, "primary");
        assert_eq!(event.processes.len(), 2);
        let first = &event.processes[0];
        assert_eq!(first.pid, 83853);
        assert_eq!(first.lock_mode, "ShareLock");
        assert_eq!(first.lock_type, "transaction");
        assert_eq!(first.blocked_by_pid, Some(83850));
        assert_eq!(first.relation_name, "accounts");
        assert!(first.query_fingerprint.is_some());
        assert_eq!(
            first.query_fingerprint,
            event.processes[1].query_fingerprint
        );
    }

    #[test]
    fn test_draft_order_independent() {
        let mut reversed = EventDraft::default();
        for line in DETAIL.lines().rev() {
            reversed.push_detail_line(line, false);
        }
        let mut forward = EventDraft::default();
        forward.push_detail_text(DETAIL);

        let a = reversed.into_event(&env(None)).unwrap();
        let b = forward.into_event(&env(None)).unwrap();
        // Process order follows the log; per-pid fields must agree.
        for p in &a.processes {
            let q = b.processes.iter().find(|q| q.pid == p.pid).unwrap();
            assert_eq!(p.lock_mode, q.lock_mode);
            assert_eq!(p.blocked_by_pid, q.blocked_by_pid);
        }
    }

    #[test]
    fn test_relation_fallback() {
        let mut draft = EventDraft {
            context_relation: Some("ctx_table".into()),
            ..Default::default()
        };
        draft.push_detail_line("Process 1: UPDATE real_table SET a = 1", false);
        draft.push_detail_line("Process 2: SELECT pg_sleep(1)", false);
        let event = draft.into_event(&env(None)).unwrap();
        assert_eq!(event.processes[0].relation_name, "real_table");
        assert_eq!(event.processes[1].relation_name, "ctx_table");

        let mut bare = EventDraft::default();
        bare.push_detail_line("Process 3: SELECT pg_sleep(1)", false);
        assert_eq!(bare.into_event(&env(None)).unwrap().processes[0].relation_name, "");
    }

    #[test]
    fn test_continuation_lines() {
        let mut draft = EventDraft::default();
        draft.push_detail_line("Process 1: UPDATE t", false);
        assert!(draft.push_detail_line("   SET a = 1 WHERE id = 2", true));
        assert!(!draft.push_detail_line("   ignored", false));
        let event = draft.into_event(&env(None)).unwrap();
        assert_eq!(event.processes[0].query, "UPDATE t SET a = 1 WHERE id = 2");
    }

    #[test]
    fn test_zero_processes_dropped() {
        let mut draft = EventDraft::default();
        draft.push_detail_line(
            "Process 1 waits for ShareLock on transaction 2; blocked by process 3.",
            false,
        );
        assert!(draft.into_event(&env(None)).is_none());
    }

    struct NoSource;

    impl LockGraphSource for NoSource {
        fn sample(&mut self) -> Result<Vec<LockWaitPair>, crate::error::CacheError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_session_cache_enrichment() {
        let cache = SessionCache::new(Box::new(NoSource), CacheConfig::default());
        let xact = DateTime::from_timestamp(1_700_000_100, 0);
        let backend = DateTime::from_timestamp(1_700_000_000, 0);
        cache.insert(SessionState {
            pid: 2,
            backend_start: backend,
            xact_start: xact,
            captured_at: Utc::now(),
        });

        let record_backend = DateTime::from_timestamp(1_600_000_000, 0);
        let mut draft = EventDraft {
            resolved_by_pid: Some(1),
            backend_start: record_backend,
            ..Default::default()
        };
        draft.push_detail_line("Process 1: UPDATE t SET a = 1", false);
        draft.push_detail_line("Process 2: UPDATE t SET a = 2", false);
        let event = draft.into_event(&env(Some(&cache))).unwrap();

        assert_eq!(event.processes[0].backend_start, record_backend);
        assert_eq!(event.processes[0].xact_start, None);
        assert_eq!(event.processes[1].backend_start, backend);
        assert_eq!(event.processes[1].xact_start, xact);
    }
}
