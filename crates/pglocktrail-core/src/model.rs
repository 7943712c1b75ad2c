//! Normalized deadlock event model.
//!
//! These are the shapes every tailer produces, regardless of the log
//! encoding they were reconstructed from.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File path → last-read byte offset.
pub type Checkpoints = HashMap<PathBuf, u64>;

/// One resolved deadlock cycle.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DeadlockEvent {
    /// When the server logged the deadlock error.
    pub detected_at: DateTime<Utc>,
    pub database_name: String,
    /// Logical instance label for multi-server setups (empty if unset).
    pub instance_name: String,
    /// Victim pid (the backend whose ERROR line was logged).
    pub resolved_by_pid: Option<i32>,
    /// How long the victim waited before the deadlock was declared.
    pub detection_time_ms: Option<u64>,
    /// Participants in the order they appear in the log.
    pub processes: Vec<DeadlockProcess>,
}

impl DeadlockEvent {
    /// Pids referenced by `blocked_by_pid` that are not participants of this
    /// event. The reference is advisory, so callers only report these.
    pub fn dangling_blockers(&self) -> Vec<i32> {
        let pids: HashSet<i32> = self.processes.iter().map(|p| p.pid).collect();
        let mut dangling: Vec<i32> = self
            .processes
            .iter()
            .filter_map(|p| p.blocked_by_pid)
            .filter(|pid| !pids.contains(pid))
            .collect();
        dangling.sort_unstable();
        dangling.dedup();
        dangling
    }

    /// Distinct relation names touched by the cycle, in discovery order.
    pub fn relations(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.processes
            .iter()
            .map(|p| p.relation_name.as_str())
            .filter(|r| !r.is_empty() && seen.insert(*r))
            .collect()
    }
}

/// One participant of a deadlock cycle.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct DeadlockProcess {
    pub pid: i32,
    /// Lock target type from the "waits for" detail (`transaction`, `relation`, `tuple`, ...).
    pub lock_type: String,
    /// Requested lock mode (`ShareLock`, `ExclusiveLock`, ...).
    pub lock_mode: String,
    pub relation_name: String,
    /// Blocked statement as logged, trimmed.
    pub query: String,
    pub blocked_by_pid: Option<i32>,
    pub query_fingerprint: Option<u64>,
    pub username: String,
    pub application_name: String,
    pub client_addr: String,
    pub backend_start: Option<DateTime<Utc>>,
    pub xact_start: Option<DateTime<Utc>>,
}

/// Snapshot of one backend captured from the live lock-wait graph.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionState {
    pub pid: i32,
    pub backend_start: Option<DateTime<Utc>>,
    pub xact_start: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}
