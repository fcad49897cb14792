use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::client::{Client, ClientIo};
use crate::config::Config;
use crate::errors::{AdmissionError, AdmissionErrorValue, StartupError};
use crate::format::FormatAdapter;
use crate::hooks::Hooks;
use crate::listener;
use crate::rate::Rate;
use crate::registry::MountRegistry;
use crate::source;
use crate::stats::Stats;
use crate::worker::WorkerPool;

/// Process-wide streaming state: the mount registry, the worker pool,
/// global counters and the injected external services.
pub struct Hub {
    started: tokio::time::Instant,
    config: RwLock<Arc<Config>>,
    pub registry: MountRegistry,
    pub pool: WorkerPool,
    pub stats: Stats,
    pub hooks: Hooks,
    running: AtomicBool,
    sources: Mutex<u64>,
    out_rate: Mutex<Rate>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_hooks(config, Hooks::default())
    }

    pub fn with_hooks(config: Config, hooks: Hooks) -> Arc<Self> {
        Arc::new(Self {
            started: tokio::time::Instant::now(),
            config: RwLock::new(Arc::new(config)),
            registry: MountRegistry::new(),
            pool: WorkerPool::new(),
            stats: Stats::new(),
            hooks,
            running: AtomicBool::new(true),
            sources: Mutex::new(0),
            out_rate: Mutex::new(Rate::new(9000)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Spawn the cooperative worker loops. Must run inside a tokio
    /// runtime.
    pub fn start_workers(self: &Arc<Self>, count: usize) {
        for _ in 0..count.max(1) {
            self.pool.spawn_worker(self);
        }
    }

    /// Milliseconds since the hub came up; the engine clock every
    /// deadline is measured on.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn now_sec(&self) -> u64 {
        self.now_ms() / 1000
    }

    pub fn instant_at(&self, ms: u64) -> tokio::time::Instant {
        self.started + std::time::Duration::from_millis(ms)
    }

    /// Current configuration snapshot. Snapshots are read per call and
    /// never held across a tick.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn replace_config(&self, config: Config) {
        *self.config.write() = Arc::new(config);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Begin server shutdown: every source drops RUNNING at its next
    /// tick and winds down through the terminating path.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn stop_workers(&self) {
        self.pool.shutdown();
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Build a client for a freshly accepted connection.
    pub fn new_client(&self, ip: impl Into<String>, io: Box<dyn ClientIo>) -> Box<Client> {
        Box::new(Client::new(
            self.next_client_id(),
            ip,
            io,
            self.now_sec(),
        ))
    }

    pub fn source_count(&self) -> u64 {
        *self.sources.lock()
    }

    /// Count a new source against the configured limit.
    pub fn try_add_source(&self) -> bool {
        let limit = self.config().limits.source_limit;
        let mut sources = self.sources.lock();
        if *sources >= limit {
            return false;
        }
        *sources += 1;
        true
    }

    pub fn dec_sources(&self) {
        let mut sources = self.sources.lock();
        *sources = sources.saturating_sub(1);
    }

    pub fn global_rate_add(&self, bytes: u64, now_ms: u64) {
        self.out_rate.lock().add(bytes, now_ms);
    }

    /// Server-wide outgoing rate, bytes per second.
    pub fn global_rate_avg(&self) -> u64 {
        self.out_rate.lock().avg()
    }

    /// Shrink the global meter's horizon after a population change.
    pub fn reduce_global_sampling(&self) {
        self.out_rate.lock().reduce(2000);
    }

    /// Send governor level against the configured bandwidth cap:
    /// 0 = open, 1..3 = progressively harder braking.
    pub fn throttle_level(&self) -> u32 {
        let max = self.config().limits.max_bandwidth;
        if max == 0 {
            return 0;
        }
        let bits = 8 * self.global_rate_avg();
        let pct = bits.saturating_mul(100) / max;
        match pct {
            0..=89 => 0,
            90..=94 => 1,
            95..=99 => 2,
            _ => 3,
        }
    }

    /// Admit a listener to a mount and schedule it. On rejection the
    /// client comes back so the caller can answer with the 403.
    pub fn add_listener(
        self: &Arc<Self>,
        mount: &str,
        mut client: Box<Client>,
    ) -> Result<(), (Box<Client>, AdmissionError)> {
        match listener::add_listener(self, mount, &mut client) {
            Ok(_outcome) => {
                client.set_flag(crate::client::CLIENT_ACTIVE);
                client.schedule_ms = 0;
                self.pool
                    .attach(client)
                    .map_err(|c| (c, AdmissionErrorValue::NoWorkers.into()))
            }
            Err(e) => Err((client, e)),
        }
    }

    /// Attach a producer to a mount. `format` is the codec adapter the
    /// connection layer picked from the content type; `None` means the
    /// type was unsupported.
    pub fn source_startup(
        self: &Arc<Self>,
        client: Box<Client>,
        uri: &str,
        format: Option<Box<dyn FormatAdapter>>,
        shoutcast_compat: bool,
    ) -> Result<(), (Box<Client>, StartupError)> {
        source::source_startup(self, client, uri, format, shoutcast_compat)
    }
}
