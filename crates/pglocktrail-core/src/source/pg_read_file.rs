//! Log access through the server's file functions.
//!
//! Used when the log directory is not mounted locally. Requires superuser
//! or the `pg_read_server_files` role.

use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use postgres::Client;
use tracing::warn;

use crate::error::SourceError;
use crate::pg::{describe_pg_error, is_permission_denied};

use super::{LogFileSource, OpenedLog};

/// Largest chunk fetched by one `open_at` call.
const MAX_READ_BYTES: i64 = 8 * 1024 * 1024;

/// Cuts a fetched chunk back to its last complete line; the server may
/// still be writing the rest. A full window without any newline holds part
/// of a line longer than the window: it is handed out as one line, its last
/// byte replaced by `\n`, so the offset still moves to the window end.
fn complete_lines(mut content: Vec<u8>, window_full: bool) -> Vec<u8> {
    match content.iter().rposition(|b| *b == b'\n') {
        Some(pos) => content.truncate(pos + 1),
        None if window_full => {
            if let Some(last) = content.last_mut() {
                *last = b'\n';
            }
        }
        None => content.clear(),
    }
    content
}

pub struct PgReadFileSource {
    client: Mutex<Client>,
}

impl PgReadFileSource {
    pub fn new(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

fn pg_io_error(e: postgres::Error) -> io::Error {
    let kind = if is_permission_denied(&e) {
        io::ErrorKind::PermissionDenied
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, describe_pg_error(&e))
}

impl LogFileSource for PgReadFileSource {
    fn list(&self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
        let matcher = glob::Pattern::new(pattern)?;
        let mut client = self
            .client
            .lock()
            .map_err(|_| SourceError::Postgres("connection mutex poisoned".into()))?;

        let dir_str = dir.to_string_lossy().into_owned();
        let rows = client
            .query(
                "SELECT name FROM pg_ls_dir($1) AS name ORDER BY 1",
                &[&dir_str],
            )
            .map_err(|e| SourceError::Postgres(describe_pg_error(&e)))?;

        let mut paths: Vec<PathBuf> = rows
            .iter()
            .filter_map(|row| row.try_get::<_, String>(0).ok())
            .filter(|name| matcher.matches(name))
            .map(|name| dir.join(name))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn open_at(&self, path: &Path, offset: u64) -> io::Result<OpenedLog> {
        let path_str = path.to_string_lossy().into_owned();
        let mut client = self
            .client
            .lock()
            .map_err(|_| io::Error::other("connection mutex poisoned"))?;

        let size: i64 = client
            .query_one("SELECT size FROM pg_stat_file($1)", &[&path_str])
            .and_then(|row| row.try_get(0))
            .map_err(pg_io_error)?;
        let len = size.max(0) as u64;
        let start = if offset > len { 0 } else { offset };

        let wanted = (len - start).min(MAX_READ_BYTES as u64) as i64;
        let content: Vec<u8> = if wanted > 0 {
            client
                .query_one(
                    "SELECT pg_read_binary_file($1, $2, $3)",
                    &[&path_str, &(start as i64), &wanted],
                )
                .and_then(|row| row.try_get(0))
                .map_err(pg_io_error)?
        } else {
            Vec::new()
        };

        let window_full = wanted == MAX_READ_BYTES;
        if window_full && !content.contains(&b'\n') {
            warn!(
                path = %path.display(),
                offset = start,
                window = MAX_READ_BYTES,
                "log line longer than the read window, splitting it"
            );
        }
        let content = complete_lines(content, window_full);

        Ok(OpenedLog {
            reader: Box::new(Cursor::new(content)),
            start,
            len,
        })
    }
}
