//! pglocktraild - PostgreSQL deadlock collector daemon.
//!
//! Tails the server log for deadlock reports, enriches them with session
//! timings sampled from `pg_locks`, and appends them to a local store.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pglocktrail_core::CancelToken;
use pglocktrail_core::monitor::{DeadlockMonitor, PgFormatProbe};
use pglocktrail_core::pg::{connect, connection_string_from_env};
use pglocktrail_core::session_cache::{CacheConfig, PgLockGraphSource, SessionCache};
use pglocktrail_core::source::{
    AccessMethod, FsLogSource, LogFileSource, LogFormat, LogSource, PgReadFileSource, discover,
};
use pglocktrail_core::store::JsonFileStore;

/// PostgreSQL deadlock collector daemon.
#[derive(Parser)]
#[command(name = "pglocktraild", about = "PostgreSQL deadlock collector daemon", version)]
struct Args {
    /// Log directory. If omitted, it is read from the server settings.
    #[arg(long, env = "PGLOCKTRAIL_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// File glob inside the log directory.
    #[arg(long, default_value = "postgresql-*.log")]
    pattern: String,

    /// Log encoding (stderr, csvlog, jsonlog). Re-detected from the server when omitted.
    #[arg(long)]
    format: Option<LogFormat>,

    /// How log files are read: fs, or pg_read_file over the connection.
    #[arg(long, default_value = "fs")]
    access: AccessMethod,

    /// Database name for events whose log record names none.
    #[arg(long)]
    database: Option<String>,

    /// Instance tag stored with every event.
    #[arg(long, default_value = "")]
    instance: String,

    /// Directory for deadlocks.jsonl and checkpoints.json.
    #[arg(long, default_value = "./data")]
    store_dir: PathBuf,

    /// Scan interval in seconds.
    #[arg(short, long, default_value = "10")]
    interval: u64,

    /// Do not sample pg_locks for session timings.
    #[arg(long)]
    no_session_cache: bool,

    /// Forget saved checkpoints and rescan all log files.
    #[arg(long)]
    reset: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pglocktraild", "pglocktrail_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// One-line summary of where logs are read from.
fn describe_source(source: &LogSource) -> String {
    format!(
        "{} ({}, via {})",
        source.directory.join(&source.pattern).display(),
        source.format,
        source.access
    )
}

/// Resolved log location and database name.
struct Target {
    source: LogSource,
    database: String,
}

fn resolve_target(args: &Args, conn: Option<&str>) -> Option<Target> {
    if let Some(dir) = &args.log_dir {
        let mut source = LogSource::new(dir, &args.pattern).with_access(args.access);
        if let Some(format) = args.format {
            source = source.with_format(format);
        }
        return Some(Target {
            source,
            database: args.database.clone().unwrap_or_else(|| "postgres".to_string()),
        });
    }

    let Some(conn) = conn else {
        error!("no --log-dir given and no PostgreSQL connection to discover it");
        return None;
    };
    let mut client = match connect(conn) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "cannot connect to discover log settings");
            print_pg_warning(&e);
            return None;
        }
    };
    let Some(discovered) = discover(&mut client) else {
        error!("logging_collector is off or log settings are unreadable");
        return None;
    };
    debug!(log_destination = %discovered.log_destination, "discovered log settings");

    let mut source = discovered.source.with_access(args.access);
    if let Some(format) = args.format {
        source = source.with_format(format);
    }
    Some(Target {
        source,
        database: args.database.clone().unwrap_or(discovered.database_name),
    })
}

fn open_file_source(access: AccessMethod, conn: Option<&str>) -> Option<Arc<dyn LogFileSource>> {
    match access {
        AccessMethod::FileSystem => Some(Arc::new(FsLogSource::new())),
        AccessMethod::PgReadFile => {
            let Some(conn) = conn else {
                error!("pg_read_file access needs a PostgreSQL connection");
                return None;
            };
            match connect(conn) {
                Ok(client) => Some(Arc::new(PgReadFileSource::new(client))),
                Err(e) => {
                    error!(error = %e, "cannot connect for pg_read_file access");
                    None
                }
            }
        }
    }
}

fn open_session_cache(conn: Option<&str>) -> Option<Arc<SessionCache>> {
    let conn = conn?;
    match PgLockGraphSource::connect(conn) {
        Ok(source) => Some(Arc::new(SessionCache::new(
            Box::new(source),
            CacheConfig::default(),
        ))),
        Err(e) => {
            warn!(error = %e, "session cache disabled");
            None
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("pglocktraild {} starting", env!("CARGO_PKG_VERSION"));

    let conn = connection_string_from_env();
    if conn.is_none() {
        debug!("no PGUSER/USER in environment, running without PostgreSQL");
    }

    let Some(target) = resolve_target(&args, conn.as_deref()) else {
        return ExitCode::FAILURE;
    };
    info!("Log source: {}", describe_source(&target.source));

    let Some(files) = open_file_source(target.source.access, conn.as_deref()) else {
        return ExitCode::FAILURE;
    };

    let store = match JsonFileStore::open(&args.store_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(dir = %args.store_dir.display(), error = %e, "cannot open store");
            return ExitCode::FAILURE;
        }
    };
    info!("Storage initialized at {}", store.dir().display());

    let session_cache = if args.no_session_cache {
        debug!("session cache: disabled");
        None
    } else {
        open_session_cache(conn.as_deref())
    };

    let mut monitor = match DeadlockMonitor::new(
        target.source,
        target.database,
        files,
        store,
        session_cache,
    ) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "cannot restore checkpoints");
            return ExitCode::FAILURE;
        }
    };

    // Follow log_destination changes unless the format was pinned.
    if args.format.is_none()
        && let Some(conn) = conn.as_deref()
    {
        match connect(conn) {
            Ok(client) => monitor = monitor.with_format_probe(Box::new(PgFormatProbe::new(client))),
            Err(e) => warn!(error = %e, "log format re-detection disabled"),
        }
    }

    monitor.set_instance_name(&args.instance);

    if args.reset {
        if let Err(e) = monitor.reset() {
            error!(error = %e, "failed to reset checkpoints");
            return ExitCode::FAILURE;
        }
    }

    // Setup graceful shutdown
    let cancel = CancelToken::new();
    let c = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        c.cancel();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    monitor.run(Duration::from_secs(args.interval.max(1)), &cancel);

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Prints a colored PostgreSQL warning with configuration hints.
fn print_pg_warning(error: &str) {
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}PostgreSQL: {error}{RESET}");
    eprintln!();
    eprintln!("{YELLOW}  Configure connection with environment variables:");
    eprintln!("    export PGHOST=localhost");
    eprintln!("    export PGPORT=5432");
    eprintln!("    export PGUSER=postgres");
    eprintln!("    export PGPASSWORD=secret");
    eprintln!("    export PGDATABASE=postgres");
    eprintln!();
    eprintln!("  Or pass --log-dir to read log files without discovery.{RESET}");
}
