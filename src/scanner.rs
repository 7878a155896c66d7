//! Periodic port scanner
//!
//! A [`ScanEngine`] owns one background thread. Every tick it asks the
//! [`PortTableProvider`] for the local TCP table, keeps the ports inside the
//! scan window that are LISTEN or ESTABLISHED, diffs them against the
//! previously published set and publishes the new set if it changed.
//!
//! Readers call [`ScanEngine::current_snapshot`] and get their own copy. The
//! snapshot lock is only held for the diff-and-swap step, never across the
//! provider query.

use crate::config::{ScanInterval, ScanWindow, ScannerConfig, ConfigError};
use crate::logger::SharedLogger;
use crate::table::{AddressFamily, PortTable, PortTableProvider, ProviderError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Ordered set of ports
pub type PortSet = BTreeSet<u16>;

/// Rows the port table starts with before the provider asks for more
const DEFAULT_TABLE_CAPACITY: usize = 256;

const WORKER_THREAD_NAME: &str = "port-scanner";

/// Validated scanner settings, immutable once the engine is built
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub window: ScanWindow,
    pub interval: ScanInterval,
    pub families: Vec<AddressFamily>,
}

impl ScanSettings {
    pub fn new(window: ScanWindow, interval: ScanInterval) -> Self {
        Self {
            window,
            interval,
            families: vec![AddressFamily::Ipv4],
        }
    }

    /// Set the address families to scan (builder pattern)
    pub fn with_families(mut self, families: Vec<AddressFamily>) -> Self {
        self.families = families;
        self
    }

    pub fn from_config(config: &ScannerConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.window()?, config.interval()).with_families(config.families.clone()))
    }
}

/// Ports that appeared and disappeared between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: PortSet,
    pub removed: PortSet,
}

impl SnapshotDiff {
    pub fn between(previous: &PortSet, current: &PortSet) -> Self {
        Self {
            added: current.difference(previous).copied().collect(),
            removed: previous.difference(current).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// `previous ∪ added − removed`
    pub fn apply(&self, previous: &PortSet) -> PortSet {
        previous
            .union(&self.added)
            .filter(|p| !self.removed.contains(p))
            .copied()
            .collect()
    }
}

/// Render a port set as `{p1,p2,...}` in ascending order
pub fn format_ports(ports: &PortSet) -> String {
    let joined: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    format!("{{{}}}", joined.join(","))
}

/// Why a tick did not produce a new snapshot
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The port table did not fit even after one resize; retried next tick
    #[error("{family} port table needs {required} entries, only {capacity} allocated after resize")]
    Resource {
        family: AddressFamily,
        required: usize,
        capacity: usize,
    },

    #[error("{provider} query for {family} failed: {source}")]
    Provider {
        provider: String,
        family: AddressFamily,
        #[source]
        source: ProviderError,
    },

    #[error("port scan panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("port scanner is already running")]
    AlreadyRunning,

    #[error("failed to spawn port scanner thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome of a successful tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub added: PortSet,
    pub removed: PortSet,
    /// Whether the published snapshot was replaced
    pub published: bool,
}

/// Read access to the occupied-port snapshot
pub trait OccupiedPorts: Send + Sync {
    /// Point-in-time copy of the occupied ports
    fn occupied_ports(&self) -> PortSet;
}

struct Shared {
    settings: ScanSettings,
    provider: Box<dyn PortTableProvider>,
    logger: SharedLogger,
    snapshot: RwLock<PortSet>,
    table_capacity: AtomicUsize,
    running: Mutex<bool>,
    wake: Condvar,
}

/// Background port scanner publishing an occupied-port snapshot
pub struct ScanEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEngine")
            .field("settings", &self.shared.settings)
            .field("provider", &self.shared.provider.name())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ScanEngine {
    pub fn new(
        settings: ScanSettings,
        provider: Box<dyn PortTableProvider>,
        logger: SharedLogger,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                provider,
                logger,
                snapshot: RwLock::new(PortSet::new()),
                table_capacity: AtomicUsize::new(DEFAULT_TABLE_CAPACITY),
                running: Mutex::new(false),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.shared.running.lock()
    }

    /// Spawn the polling thread. The first scan happens immediately.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut worker = self.worker.lock();

        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return Err(EngineError::AlreadyRunning);
            }
            // The previous thread died on its own; reap it before restarting
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }

        *self.shared.running.lock() = true;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                let settings = &self.shared.settings;
                self.shared.logger.info(&format!(
                    "port scanner started: window [{},{}], interval {}s, provider {}",
                    settings.window.begin(),
                    settings.window.end(),
                    settings.interval.as_duration().as_secs(),
                    self.shared.provider.name()
                ));
                Ok(())
            }
            Err(e) => {
                *self.shared.running.lock() = false;
                Err(EngineError::Spawn(e))
            }
        }
    }

    /// Signal the polling thread, wake it and wait for it to exit.
    ///
    /// Returns immediately if the engine is not running.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();

        *self.shared.running.lock() = false;
        self.shared.wake.notify_all();

        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                self.shared.logger.error("port scanner thread terminated abnormally");
            }
            self.shared.logger.info("port scanner stopped");
        }
    }

    /// Copy of the currently published snapshot
    pub fn current_snapshot(&self) -> PortSet {
        self.shared.snapshot.read().clone()
    }

    /// Run one tick on the calling thread
    pub fn scan_now(&self) -> Result<TickReport, ScanError> {
        self.shared.tick()
    }
}

impl OccupiedPorts for ScanEngine {
    fn occupied_ports(&self) -> PortSet {
        self.current_snapshot()
    }
}

impl Drop for ScanEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        let interval = self.settings.interval.as_duration();

        loop {
            let next_run = Instant::now().checked_add(interval);

            self.guarded_tick();

            let mut running = self.running.lock();
            while *running {
                match next_run {
                    Some(deadline) => {
                        if self.wake.wait_until(&mut running, deadline).timed_out() {
                            break;
                        }
                    }
                    // Deadline not representable; only stop() ends the wait
                    None => self.wake.wait(&mut running),
                }
            }
            if !*running {
                break;
            }
        }
    }

    /// One tick; failures are logged and never leave this function
    fn guarded_tick(&self) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.tick()))
            .unwrap_or_else(|payload| Err(ScanError::Panicked(panic_message(payload.as_ref()))));

        match result {
            Ok(_) => {}
            Err(e @ ScanError::Resource { .. }) => {
                self.logger
                    .error(&format!("port scan skipped, keeping previous snapshot: {e}"));
            }
            Err(e) => {
                self.logger.error(&format!("port scan failed: {e}"));
            }
        }
    }

    fn tick(&self) -> Result<TickReport, ScanError> {
        let current = self.collect()?;
        Ok(self.publish(current))
    }

    fn collect(&self) -> Result<PortSet, ScanError> {
        let window = self.settings.window;
        let mut current = PortSet::new();

        for &family in &self.settings.families {
            let table = self.query_table(family)?;
            current.extend(
                table
                    .entries()
                    .iter()
                    .filter(|e| e.state.is_occupied() && window.contains(e.port))
                    .map(|e| e.port),
            );
        }

        Ok(current)
    }

    /// Query with the current capacity; on insufficient buffer resize once
    fn query_table(&self, family: AddressFamily) -> Result<PortTable, ScanError> {
        let mut table = PortTable::with_capacity(self.table_capacity.load(Ordering::Relaxed));

        match self.provider.query(family, &mut table) {
            Ok(()) => return Ok(table),
            Err(ProviderError::InsufficientBuffer { required, .. }) => {
                self.table_capacity.fetch_max(required, Ordering::Relaxed);
                table = PortTable::with_capacity(required);
            }
            Err(source) => return Err(self.provider_error(family, source)),
        }

        match self.provider.query(family, &mut table) {
            Ok(()) => Ok(table),
            Err(ProviderError::InsufficientBuffer { required, capacity }) => {
                self.table_capacity.fetch_max(required, Ordering::Relaxed);
                Err(ScanError::Resource {
                    family,
                    required,
                    capacity,
                })
            }
            Err(source) => Err(self.provider_error(family, source)),
        }
    }

    fn provider_error(&self, family: AddressFamily, source: ProviderError) -> ScanError {
        ScanError::Provider {
            provider: self.provider.name().to_string(),
            family,
            source,
        }
    }

    fn publish(&self, current: PortSet) -> TickReport {
        let (diff, published) = {
            let mut snapshot = self.snapshot.write();
            let diff = SnapshotDiff::between(&snapshot, &current);
            let published = *snapshot != current;
            if published {
                *snapshot = current.clone();
            }
            (diff, published)
        };

        if !diff.added.is_empty() {
            self.logger
                .info(&format!("services online: {}", format_ports(&diff.added)));
        }
        if !diff.removed.is_empty() {
            self.logger
                .info(&format!("services offline: {}", format_ports(&diff.removed)));
        }
        if published {
            self.logger
                .info(&format!("occupied ports: {}", format_ports(&current)));
        }

        TickReport {
            added: diff.added,
            removed: diff.removed,
            published,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
