use crate::storage::DurabilityMode;
use anyhow::{Context, Result, bail};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Where and how the run store keeps its data.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding the WAL and snapshot files
    pub data_dir: PathBuf,

    pub durability: DurabilityMode,

    /// WAL entries between snapshot checkpoints
    pub checkpoint_entries: usize,
}

impl StorageConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            durability: DurabilityMode::Sync,
            checkpoint_entries: 1000,
        }
    }

    /// Memory-only store; `data_dir` is never touched.
    pub fn in_memory() -> Self {
        Self::new("data").durability(DurabilityMode::None)
    }

    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    pub fn checkpoint_entries(mut self, entries: usize) -> Self {
        self.checkpoint_entries = entries.max(1);
        self
    }
}

/// Event stream pacing.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum events fetched per poll
    pub fetch_limit: usize,

    /// Minimum time between keepalive frames on an idle stream
    pub keepalive: Duration,

    /// Wait between polls when no events are pending
    pub poll_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 200,
            keepalive: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl StreamConfig {
    pub fn fetch_limit(mut self, limit: usize) -> Self {
        self.fetch_limit = limit.max(1);
        self
    }

    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Retention sweeper settings.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Finished runs older than this are deleted
    pub ttl: Duration,

    /// Time between sweeps
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            interval: Duration::from_secs(60),
        }
    }
}

impl RetentionConfig {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Emit a `partial` event every N steps; 0 disables them
    pub emit_partial_every: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            emit_partial_every: 1,
        }
    }
}

impl WorkerConfig {
    pub fn emit_partial_every(mut self, steps: u32) -> Self {
        self.emit_partial_every = steps;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage: StorageConfig,
    pub stream: StreamConfig,
    pub retention: RetentionConfig,
    pub worker: WorkerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            storage: StorageConfig::new("data"),
            stream: StreamConfig::default(),
            retention: RetentionConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("APP_HOST").unwrap_or(defaults.host);
        let port = parse_or(&lookup, "APP_PORT", defaults.port)?;

        let storage = StorageConfig::new(
            lookup("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage.data_dir),
        )
        .durability(parse_or(&lookup, "DURABILITY", defaults.storage.durability)?)
        .checkpoint_entries(parse_or(
            &lookup,
            "WAL_CHECKPOINT_ENTRIES",
            defaults.storage.checkpoint_entries,
        )?);

        let stream = StreamConfig::default()
            .fetch_limit(parse_or(&lookup, "EVENTS_FETCH_LIMIT", defaults.stream.fetch_limit)?)
            .keepalive(seconds_or(&lookup, "KEEPALIVE_SECONDS", defaults.stream.keepalive)?)
            .poll_interval(seconds_or(
                &lookup,
                "POLL_INTERVAL_SECONDS",
                defaults.stream.poll_interval,
            )?);

        let retention = RetentionConfig::default()
            .ttl(seconds_or(&lookup, "EVENT_TTL_SECONDS", defaults.retention.ttl)?)
            .interval(seconds_or(
                &lookup,
                "CLEANUP_INTERVAL_SECONDS",
                defaults.retention.interval,
            )?);

        let worker = WorkerConfig::default().emit_partial_every(parse_or(
            &lookup,
            "EMIT_PARTIAL_EVERY_N_STEPS",
            defaults.worker.emit_partial_every,
        )?);

        Ok(Self {
            host,
            port,
            storage,
            stream,
            retention,
            worker,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}

/// Fractional seconds, e.g. `0.5`.
fn seconds_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let seconds: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a number of seconds"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        bail!("{key} must be a non-negative number of seconds, got {seconds}");
    }
    Ok(Duration::from_secs_f64(seconds))
}
