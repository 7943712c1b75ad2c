//! Periodic deadlock collection.
//!
//! [`DeadlockMonitor`] ties a tailer to a store: every cycle it optionally
//! re-checks which log encoding the server writes, scans, and persists the
//! tailer's checkpoints so a restart resumes where the last cycle stopped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use postgres::Client;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{StoreError, TailError};
use crate::model::Checkpoints;
use crate::pg::show_setting;
use crate::session_cache::SessionCache;
use crate::source::{LogFileSource, LogFormat, LogSource};
use crate::store::EventStore;
use crate::tailer::{DeadlockTailer, TailerConfig, new_tailer};

/// Reports the encoding the server currently writes, if known.
pub trait FormatProbe: Send {
    fn probe(&mut self) -> Option<LogFormat>;
}

/// Reads `log_destination` over a PostgreSQL connection.
pub struct PgFormatProbe {
    client: Client,
}

impl PgFormatProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl FormatProbe for PgFormatProbe {
    fn probe(&mut self) -> Option<LogFormat> {
        show_setting(&mut self.client, "log_destination")
            .map(|dest| LogFormat::detect_from_destination(&dest))
    }
}

struct Active {
    tailer: Box<dyn DeadlockTailer>,
    instance_name: String,
}

/// Everything needed to build a tailer for a given format.
struct TailerFactory {
    source: LogSource,
    database_name: String,
    files: Arc<dyn LogFileSource>,
    store: Arc<dyn EventStore>,
    session_cache: Option<Arc<SessionCache>>,
}

impl TailerFactory {
    /// New tailer for `format` with its checkpoints restored from the store.
    fn build(&self, format: LogFormat) -> Result<Box<dyn DeadlockTailer>, StoreError> {
        let config = TailerConfig::new(
            &self.source.directory,
            self.source.pattern_for(format),
            &self.database_name,
        );
        let tailer = new_tailer(
            format,
            config,
            Arc::clone(&self.files),
            Arc::clone(&self.store),
            self.session_cache.clone(),
        );
        let saved = self.store.checkpoints(tailer.key())?;
        debug!(format = %format, files = saved.len(), "restored checkpoints");
        tailer.set_checkpoints(&saved);
        Ok(tailer)
    }
}

pub struct DeadlockMonitor {
    factory: TailerFactory,
    probe: Option<Mutex<Box<dyn FormatProbe>>>,
    active: Mutex<Active>,
}

impl DeadlockMonitor {
    pub fn new(
        source: LogSource,
        database_name: impl Into<String>,
        files: Arc<dyn LogFileSource>,
        store: Arc<dyn EventStore>,
        session_cache: Option<Arc<SessionCache>>,
    ) -> Result<Self, StoreError> {
        let factory = TailerFactory {
            source,
            database_name: database_name.into(),
            files,
            store,
            session_cache,
        };
        let tailer = factory.build(factory.source.format)?;
        Ok(Self {
            factory,
            probe: None,
            active: Mutex::new(Active {
                tailer,
                instance_name: String::new(),
            }),
        })
    }

    /// Re-detect the log format before every scan.
    pub fn with_format_probe(mut self, probe: Box<dyn FormatProbe>) -> Self {
        self.probe = Some(Mutex::new(probe));
        self
    }

    fn lock_active(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn probe_format(&self) -> Option<LogFormat> {
        let probe = self.probe.as_ref()?;
        probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .probe()
    }

    pub fn format(&self) -> LogFormat {
        self.lock_active().tailer.format()
    }

    pub fn checkpoints(&self) -> Checkpoints {
        self.lock_active().tailer.checkpoints()
    }

    /// One collection cycle. Returns how many events were persisted.
    pub fn scan_once(
        &self,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<usize, TailError> {
        let mut active = self.lock_active();

        if let Some(format) = self.probe_format()
            && format != active.tailer.format()
        {
            match self.factory.build(format) {
                Ok(tailer) => {
                    info!(from = %active.tailer.format(), to = %format, "log format changed");
                    tailer.set_instance_name(&active.instance_name);
                    active.tailer = tailer;
                }
                Err(e) => {
                    warn!(format = %format, error = %e, "cannot switch log format, keeping current");
                }
            }
        }

        let result = active.tailer.scan_with_progress(cancel, progress);

        let key = active.tailer.key();
        if let Err(e) = self.factory.store.save_checkpoints(key, &active.tailer.checkpoints()) {
            warn!(key, error = %e, "failed to save checkpoints");
            if let Ok(persisted) = result {
                return Err(TailError::Store {
                    persisted,
                    failed: 0,
                    source: e,
                });
            }
        }
        result
    }

    /// Scans immediately and then every `interval` until `cancel` fires.
    /// The session cache, if any, runs for the lifetime of the loop.
    pub fn run(&self, interval: Duration, cancel: &CancelToken) {
        if let Some(cache) = &self.factory.session_cache {
            cache.start(cancel);
        }
        info!(
            format = %self.format(),
            dir = %self.factory.source.directory.display(),
            interval_s = interval.as_secs_f64(),
            "deadlock monitor started"
        );

        loop {
            match self.scan_once(cancel, &mut |_, _| {}) {
                Ok(n) => debug!(events = n, "scan complete"),
                Err(TailError::Cancelled) => break,
                Err(e) => warn!(error = %e, "deadlock scan failed"),
            }
            if !cancel.sleep(interval) {
                break;
            }
        }

        if let Some(cache) = &self.factory.session_cache {
            cache.stop();
        }
        info!("deadlock monitor stopped");
    }

    /// Forgets every checkpoint, in memory and in the store. The next scan
    /// reads all files from the start.
    pub fn reset(&self) -> Result<(), StoreError> {
        let active = self.lock_active();
        active.tailer.reset_checkpoints();
        self.factory
            .store
            .save_checkpoints(active.tailer.key(), &Checkpoints::new())?;
        info!(format = %active.tailer.format(), "checkpoints reset");
        Ok(())
    }

    pub fn set_instance_name(&self, name: &str) {
        let mut active = self.lock_active();
        active.instance_name = name.to_string();
        active.tailer.set_instance_name(name);
    }
}
