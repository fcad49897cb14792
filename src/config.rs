use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Server configuration. Every section carries defaults so a partial
/// file (or none at all) still yields a runnable setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub webroot_dir: String,
    /// Cooperative worker loops to run.
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 8000,
            webroot_dir: "./webroot".to_string(),
            workers: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Upper bound on queued stream data per mount, bytes.
    pub queue_size_limit: u64,
    /// Bytes of recent stream retained behind the live edge for
    /// reconnecting listeners.
    pub min_queue_size: u64,
    /// Default pre-roll handed to a new listener, bytes.
    pub burst_size: u64,
    /// Seconds without producer data before a source is dropped.
    pub source_timeout: u64,
    /// Maximum concurrent sources.
    pub source_limit: u64,
    /// Server-wide outgoing limit in bits per second; 0 disables.
    pub max_bandwidth: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            queue_size_limit: 500_000,
            min_queue_size: 50_000,
            burst_size: 64_000,
            source_timeout: 10,
            source_limit: 16,
            max_bandwidth: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty".
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Per-mount options. Zero values on sizes/timeouts mean "inherit the
/// global limit"; `-1` means unlimited or off on the signed knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub mount: String,
    pub fallback_mount: Option<String>,
    pub fallback_override: bool,
    pub fallback_when_full: bool,
    /// -1 = unlimited.
    pub max_listeners: i64,
    /// Bits per second; -1 = no per-mount cap.
    pub max_bandwidth: i64,
    /// Seconds a listener may stay connected; 0 = unlimited.
    pub max_listener_duration: u64,
    /// Seconds a producer may stream; 0 = unlimited.
    pub max_stream_duration: u64,
    pub source_timeout: u64,
    pub queue_size_limit: u64,
    pub min_queue_size: u64,
    /// -1 = inherit the global burst size.
    pub burst_size: i64,
    /// Producer ingest cap in bits per second; 0 = off.
    pub limit_rate: u64,
    /// Seconds the mount stays reserved after the producer leaves.
    pub wait_time: u64,
    /// strftime-expanded at stream start.
    pub dumpfile: Option<String>,
    /// Relative to `webroot_dir`.
    pub intro_filename: Option<String>,
    pub on_connect: Option<String>,
    pub on_disconnect: Option<String>,
    pub stream_name: Option<String>,
    pub stream_description: Option<String>,
    pub stream_url: Option<String>,
    pub stream_genre: Option<String>,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
    pub subtype: Option<String>,
    pub bitrate: Option<String>,
    /// -1 = take the producer's ice-public header.
    pub yp_public: i64,
    pub hidden: bool,
    pub allow_duplicate_users: bool,
    pub drop_existing_listener: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount: String::new(),
            fallback_mount: None,
            fallback_override: false,
            fallback_when_full: false,
            max_listeners: -1,
            max_bandwidth: -1,
            max_listener_duration: 0,
            max_stream_duration: 0,
            source_timeout: 0,
            queue_size_limit: 0,
            min_queue_size: 0,
            burst_size: -1,
            limit_rate: 0,
            wait_time: 0,
            dumpfile: None,
            intro_filename: None,
            on_connect: None,
            on_disconnect: None,
            stream_name: None,
            stream_description: None,
            stream_url: None,
            stream_genre: None,
            content_type: None,
            subtype: None,
            bitrate: None,
            yp_public: -1,
            hidden: false,
            allow_duplicate_users: true,
            drop_existing_listener: false,
        }
    }
}

impl Config {
    /// Load from an optional file plus `MOUNTCAST_*` environment
    /// overrides (`MOUNTCAST_SERVER__PORT=9000` style).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();
        if let Some(p) = path {
            builder = builder.add_source(File::from(p));
        }
        builder
            .add_source(Environment::with_prefix("MOUNTCAST").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn find_mount(&self, mount: &str) -> Option<&MountConfig> {
        self.mounts.iter().find(|m| m.mount == mount)
    }
}

impl MountConfig {
    pub fn named(mount: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            ..Self::default()
        }
    }
}
