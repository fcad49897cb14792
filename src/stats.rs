use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Latest published numbers for one mount. Counters are folded in by the
/// source under its own lock, so per-mount updates are already
/// linearised when they land here.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MountStats {
    pub listeners: u64,
    pub listener_peak: u64,
    pub listener_connections: u64,
    pub slow_listeners: u64,
    pub queue_size: u64,
    pub outgoing_kbitrate: u64,
    pub incoming_bitrate: u64,
    pub total_bytes_read: u64,
    pub total_bytes_sent: u64,
    pub total_mbytes_sent: u64,
    /// Seconds the producer has been connected.
    pub connected: u64,
    pub server_type: Option<String>,
    pub server_name: Option<String>,
    pub server_description: Option<String>,
    pub server_url: Option<String>,
    pub genre: Option<String>,
    pub bitrate: Option<String>,
    pub subtype: Option<String>,
    pub audio_info: BTreeMap<String, String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub stream_start: Option<DateTime<Local>>,
    pub listenurl: Option<String>,
    pub max_listeners: Option<i64>,
    pub public: bool,
    pub on_demand: bool,
    #[serde(skip_serializing)]
    pub hidden: bool,
}

/// Server-wide counters.
#[derive(Debug, Clone, Serialize, Default)]
pub struct GlobalStats {
    pub sources: u64,
    pub listeners: u64,
    pub listener_connections: u64,
    pub source_total_connections: u64,
    pub source_client_connections: u64,
    pub stream_kbytes_read: u64,
    pub stream_kbytes_sent: u64,
    pub outgoing_kbitrate: u64,
}

/// Process-wide stats sink: the most recent snapshot per mount plus the
/// global counters. Observers read serialisable copies; hidden mounts
/// are filtered out of the public view.
pub struct Stats {
    mounts: RwLock<BTreeMap<String, MountStats>>,
    global: Mutex<GlobalStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub global: GlobalStats,
    pub mounts: BTreeMap<String, MountStats>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(BTreeMap::new()),
            global: Mutex::new(GlobalStats::default()),
        }
    }

    pub fn update_mount(&self, mount: &str, f: impl FnOnce(&mut MountStats)) {
        let mut map = self.mounts.write();
        f(map.entry(mount.to_string()).or_default());
    }

    pub fn remove_mount(&self, mount: &str) {
        self.mounts.write().remove(mount);
    }

    pub fn mount(&self, mount: &str) -> Option<MountStats> {
        self.mounts.read().get(mount).cloned()
    }

    pub fn update_global(&self, f: impl FnOnce(&mut GlobalStats)) {
        f(&mut self.global.lock());
    }

    pub fn global(&self) -> GlobalStats {
        self.global.lock().clone()
    }

    /// Public view: hidden mounts excluded.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            global: self.global.lock().clone(),
            mounts: self
                .mounts
                .read()
                .iter()
                .filter(|(_, m)| !m.hidden)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Snapshot rendered for status pages and admin endpoints.
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
