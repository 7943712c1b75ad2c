//! Log source description and byte access.
//!
//! A [`LogSource`] says where the server writes its logs and in which
//! encoding; a [`LogFileSource`] lists and opens the matching files, either
//! directly on disk or through the server's file access functions.

mod fs;
mod pg_read_file;

use std::fmt;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use postgres::Client;
use tracing::debug;

use crate::error::SourceError;
use crate::pg::show_setting;

pub use fs::FsLogSource;
pub use pg_read_file::PgReadFileSource;

/// Encoding of the server log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogFormat {
    Stderr,
    Csv,
    Json,
}

impl LogFormat {
    /// Picks the richest encoding listed in `log_destination`
    /// (jsonlog, then csvlog, then stderr).
    pub fn detect_from_destination(log_destination: &str) -> Self {
        let dest = log_destination.to_ascii_lowercase();
        if dest.contains("jsonlog") {
            LogFormat::Json
        } else if dest.contains("csvlog") {
            LogFormat::Csv
        } else {
            LogFormat::Stderr
        }
    }

    /// Format implied by a file extension, if any.
    pub fn detect_from_filename(name: &str) -> Option<Self> {
        if name.ends_with(".csv") {
            Some(LogFormat::Csv)
        } else if name.ends_with(".json") {
            Some(LogFormat::Json)
        } else if name.ends_with(".log") {
            Some(LogFormat::Stderr)
        } else {
            None
        }
    }

    /// File extension PostgreSQL uses for this encoding.
    pub fn extension(self) -> &'static str {
        match self {
            LogFormat::Stderr => ".log",
            LogFormat::Csv => ".csv",
            LogFormat::Json => ".json",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Stderr => "stderr",
            LogFormat::Csv => "csvlog",
            LogFormat::Json => "jsonlog",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stderr" => Ok(LogFormat::Stderr),
            "csv" | "csvlog" => Ok(LogFormat::Csv),
            "json" | "jsonlog" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// How log bytes are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMethod {
    #[default]
    FileSystem,
    /// Server-side `pg_read_binary_file()`; needs superuser or `pg_read_server_files`.
    PgReadFile,
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMethod::FileSystem => f.write_str("filesystem"),
            AccessMethod::PgReadFile => f.write_str("pg_read_file"),
        }
    }
}

impl FromStr for AccessMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(AccessMethod::FileSystem),
            "pg_read_file" | "pg" => Ok(AccessMethod::PgReadFile),
            other => Err(format!("unknown access method: {other}")),
        }
    }
}

/// Where the server log lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSource {
    pub directory: PathBuf,
    /// Glob for stderr files, e.g. `postgresql-*.log`.
    pub pattern: String,
    pub format: LogFormat,
    pub access: AccessMethod,
}

impl LogSource {
    /// Format is inferred from the pattern's extension (stderr if none).
    pub fn new(directory: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let format = LogFormat::detect_from_filename(&pattern).unwrap_or(LogFormat::Stderr);
        Self {
            directory: directory.into(),
            pattern,
            format,
            access: AccessMethod::FileSystem,
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_access(mut self, access: AccessMethod) -> Self {
        self.access = access;
        self
    }

    /// The file glob for `format`. PostgreSQL writes csvlog/jsonlog next to
    /// the stderr file with the `.log` suffix replaced.
    pub fn pattern_for(&self, format: LogFormat) -> String {
        for ext in [".log", ".csv", ".json"] {
            if let Some(stem) = self.pattern.strip_suffix(ext) {
                return format!("{stem}{}", format.extension());
            }
        }
        self.pattern.clone()
    }
}

/// Server logging configuration read by [`discover`].
#[derive(Debug, Clone)]
pub struct DiscoveredSource {
    pub source: LogSource,
    pub database_name: String,
    /// Raw `log_destination` value.
    pub log_destination: String,
}

/// Reads the server's logging settings and builds a [`LogSource`].
///
/// Returns `None` when `logging_collector` is off or the log directory
/// cannot be read; there are no files to tail in that case.
pub fn discover(client: &mut Client) -> Option<DiscoveredSource> {
    let collector = show_setting(client, "logging_collector")?;
    if collector != "on" {
        debug!(logging_collector = %collector, "logging collector disabled");
        return None;
    }

    let log_directory = show_setting(client, "log_directory")?;
    let data_directory = show_setting(client, "data_directory");
    let log_filename =
        show_setting(client, "log_filename").unwrap_or_else(|| "postgresql-*.log".to_string());
    let log_destination = show_setting(client, "log_destination").unwrap_or_default();

    let directory = resolve_log_directory(&log_directory, data_directory.as_deref());
    let database_name = client
        .query_one("SELECT current_database()", &[])
        .ok()
        .and_then(|row| row.try_get::<_, String>(0).ok())
        .unwrap_or_else(|| "unknown".to_string());

    let source = LogSource::new(directory, log_filename_to_glob(&log_filename))
        .with_format(LogFormat::detect_from_destination(&log_destination));

    Some(DiscoveredSource {
        source,
        database_name,
        log_destination,
    })
}

fn resolve_log_directory(log_directory: &str, data_directory: Option<&str>) -> PathBuf {
    let dir = Path::new(log_directory);
    match data_directory {
        Some(data) if dir.is_relative() => Path::new(data).join(dir),
        _ => dir.to_path_buf(),
    }
}

/// strftime escapes accepted in `log_filename`.
const LOG_FILENAME_PLACEHOLDERS: &[&str] = &[
    "%Y", "%m", "%d", "%H", "%M", "%S", "%a", "%b", "%j", "%W", "%y", "%I", "%p", "%e", "%c",
    "%n",
];

/// Converts a `log_filename` setting into a glob:
/// `postgresql-%Y-%m-%d_%H%M%S.log` becomes `postgresql-*-*-*_*.log`.
pub fn log_filename_to_glob(log_filename: &str) -> String {
    let mut result = log_filename.to_string();
    for ph in LOG_FILENAME_PLACEHOLDERS {
        result = result.replace(ph, "*");
    }
    while result.contains("**") {
        result = result.replace("**", "*");
    }
    result
}

/// A log file opened for incremental reading.
pub struct OpenedLog {
    pub reader: Box<dyn BufRead + Send>,
    /// Offset the reader starts at. Zero if the requested offset was past
    /// the end (truncation or rotation) or could not be sought to.
    pub start: u64,
    /// File length at open time.
    pub len: u64,
}

/// Lists and opens log files.
pub trait LogFileSource: Send + Sync {
    /// Files in `dir` matching `pattern`, sorted by path.
    fn list(&self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, SourceError>;

    /// Opens `path` positioned at `offset`.
    fn open_at(&self, path: &Path, offset: u64) -> io::Result<OpenedLog>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_from_destination() {
        assert_eq!(LogFormat::detect_from_destination("stderr"), LogFormat::Stderr);
        assert_eq!(
            LogFormat::detect_from_destination("stderr,csvlog"),
            LogFormat::Csv
        );
        assert_eq!(
            LogFormat::detect_from_destination("csvlog, JSONLOG"),
            LogFormat::Json
        );
        assert_eq!(LogFormat::detect_from_destination(""), LogFormat::Stderr);
    }

    #[test]
    fn test_detect_from_filename() {
        assert_eq!(
            LogFormat::detect_from_filename("postgresql-2024.csv"),
            Some(LogFormat::Csv)
        );
        assert_eq!(
            LogFormat::detect_from_filename("pg.json"),
            Some(LogFormat::Json)
        );
        assert_eq!(
            LogFormat::detect_from_filename("pg.log"),
            Some(LogFormat::Stderr)
        );
        assert_eq!(LogFormat::detect_from_filename("pg.txt"), None);
    }

    #[test]
    fn test_log_filename_to_glob() {
        assert_eq!(
            log_filename_to_glob("postgresql-%Y-%m-%d_%H%M%S.log"),
            "postgresql-*-*-*_*.log"
        );
        assert_eq!(log_filename_to_glob("postgresql-%a.log"), "postgresql-*.log");
        assert_eq!(log_filename_to_glob("server.log"), "server.log");
    }

    #[test]
    fn test_pattern_for_swaps_suffix() {
        let src = LogSource::new("/var/log/pg", "postgresql-*.log");
        assert_eq!(src.pattern_for(LogFormat::Csv), "postgresql-*.csv");
        assert_eq!(src.pattern_for(LogFormat::Json), "postgresql-*.json");
        assert_eq!(src.pattern_for(LogFormat::Stderr), "postgresql-*.log");

        let bare = LogSource::new("/x", "postgresql-*");
        assert_eq!(bare.pattern_for(LogFormat::Csv), "postgresql-*");
    }

    #[test]
    fn test_source_infers_format() {
        assert_eq!(LogSource::new("/x", "pg-*.csv").format, LogFormat::Csv);
        assert_eq!(LogSource::new("/x", "pg-*").format, LogFormat::Stderr);
    }

    #[test]
    fn test_resolve_log_directory() {
        assert_eq!(
            resolve_log_directory("log", Some("/var/lib/pg/data")),
            PathBuf::from("/var/lib/pg/data/log")
        );
        assert_eq!(
            resolve_log_directory("/var/log/pg", Some("/data")),
            PathBuf::from("/var/log/pg")
        );
        assert_eq!(resolve_log_directory("log", None), PathBuf::from("log"));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("jsonlog".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("CSV".parse::<LogFormat>(), Ok(LogFormat::Csv));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(
            "pg_read_file".parse::<AccessMethod>(),
            Ok(AccessMethod::PgReadFile)
        );
    }
}
