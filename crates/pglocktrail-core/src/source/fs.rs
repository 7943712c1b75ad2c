//! Direct filesystem access to log files.

use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SourceError;

use super::{LogFileSource, OpenedLog};

/// Read buffer size for log files.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Reads log files from a locally mounted directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsLogSource;

impl FsLogSource {
    pub fn new() -> Self {
        Self
    }
}

impl LogFileSource for FsLogSource {
    fn list(&self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
        let full = dir.join(pattern);
        let mut paths: Vec<PathBuf> = glob::glob(&full.to_string_lossy())?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    debug!(error = %e, "skipping unreadable glob entry");
                    None
                }
            })
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn open_at(&self, path: &Path, offset: u64) -> io::Result<OpenedLog> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();

        // Shrunk below the checkpoint: truncated or rotated in place.
        let mut start = if offset > len { 0 } else { offset };
        if start > 0 && file.seek(SeekFrom::Start(start)).is_err() {
            file = File::open(path)?;
            start = 0;
        }

        Ok(OpenedLog {
            reader: Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file)),
            start,
            len,
        })
    }
}
