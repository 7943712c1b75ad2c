//! Lock-wait graph sampling over a live PostgreSQL connection.

use chrono::{DateTime, Utc};
use postgres::Client;

use crate::error::CacheError;
use crate::pg::describe_pg_error;

use super::{LockGraphSource, LockWaitPair, SessionSample};

/// Every (waiting, holding) backend pair on the same lock target.
/// Timestamps are epoch microseconds, NULL when absent.
const LOCK_WAIT_PAIRS_QUERY: &str = r#"
    SELECT DISTINCT
        blocked.pid,
        (EXTRACT(EPOCH FROM blocked_activity.backend_start) * 1000000)::bigint AS blocked_backend_start,
        (EXTRACT(EPOCH FROM blocked_activity.xact_start) * 1000000)::bigint AS blocked_xact_start,
        blocker.pid,
        (EXTRACT(EPOCH FROM blocker_activity.backend_start) * 1000000)::bigint AS blocker_backend_start,
        (EXTRACT(EPOCH FROM blocker_activity.xact_start) * 1000000)::bigint AS blocker_xact_start
    FROM pg_locks blocked
    JOIN pg_locks blocker ON (
        blocker.locktype = blocked.locktype
        AND blocker.database IS NOT DISTINCT FROM blocked.database
        AND blocker.relation IS NOT DISTINCT FROM blocked.relation
        AND blocker.granted = true
        AND blocked.granted = false
    )
    JOIN pg_stat_activity blocked_activity ON blocked_activity.pid = blocked.pid
    JOIN pg_stat_activity blocker_activity ON blocker_activity.pid = blocker.pid
"#;

/// [`LockGraphSource`] backed by a blocking `postgres::Client`.
pub struct PgLockGraphSource {
    client: Client,
}

impl PgLockGraphSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects with the given libpq-style connection string.
    pub fn connect(connection_string: &str) -> Result<Self, CacheError> {
        crate::pg::connect(connection_string)
            .map(Self::new)
            .map_err(CacheError::Query)
    }
}

impl LockGraphSource for PgLockGraphSource {
    fn sample(&mut self) -> Result<Vec<LockWaitPair>, CacheError> {
        let rows = self
            .client
            .query(LOCK_WAIT_PAIRS_QUERY, &[])
            .map_err(|e| CacheError::Query(describe_pg_error(&e)))?;

        Ok(rows.iter().filter_map(parse_pair_row).collect())
    }
}

/// Returns `None` if either pid fails to deserialize.
fn parse_pair_row(row: &postgres::Row) -> Option<LockWaitPair> {
    let blocked_pid: i32 = row.try_get(0).ok()?;
    let blocker_pid: i32 = row.try_get(3).ok()?;

    Some(LockWaitPair {
        blocked: SessionSample {
            pid: blocked_pid,
            backend_start: micros_column(row, 1),
            xact_start: micros_column(row, 2),
        },
        blocker: SessionSample {
            pid: blocker_pid,
            backend_start: micros_column(row, 4),
            xact_start: micros_column(row, 5),
        },
    })
}

fn micros_column(row: &postgres::Row, idx: usize) -> Option<DateTime<Utc>> {
    let micros: Option<i64> = row.try_get(idx).ok()?;
    DateTime::from_timestamp_micros(micros?)
}
