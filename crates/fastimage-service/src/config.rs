use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the service.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "fastimage".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the two cache tiers.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Maximum number of decoded entries kept in memory.
    ///
    /// Values below `1` are treated as `1`.
    pub in_memory_capacity: usize,

    /// Maximum age of an entry in minutes, in memory as well as on disk.
    ///
    /// Zero or negative values disable age based expiry.
    pub ttl_minutes: i64,

    /// Maximum duration an in-memory entry may go without being read.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,

    /// Number of recently read entries that are held on to even after eviction.
    pub recency_ring_size: usize,

    /// Whether fetched resources are written through to the disk tier.
    ///
    /// This only has an effect when [`Config::cache_dir`] is configured.
    pub persist_to_disk: bool,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            in_memory_capacity: 25,
            // 160 days
            ttl_minutes: 60 * 24 * 160,
            max_unused_for: None,
            recency_ring_size: 90,
            persist_to_disk: true,
        }
    }
}

impl CacheConfigs {
    /// The maximum age of an entry, if age based expiry is enabled.
    pub fn ttl(&self) -> Option<Duration> {
        u64::try_from(self.ttl_minutes)
            .ok()
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
    }
}

/// Timeouts applied to a single fetch.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DownloadTimeouts {
    /// Timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// Upper bound for a whole fetch, from opening the stream to its last read.
    #[serde(with = "humantime_serde")]
    pub max_download: Option<Duration>,
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            max_download: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of the disk tier.
    ///
    /// Leaving this as `None` disables the disk tier.
    pub cache_dir: Option<PathBuf>,

    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to.
    pub sentry_dsn: Option<Dsn>,

    /// Cache tier configuration.
    pub caches: CacheConfigs,

    /// Look up the cache on the calling context when a slot is bound.
    ///
    /// This may read from disk synchronously, trading a blocking read for not flashing a
    /// "queued" state for resources that are already available.
    pub cache_first_sync: bool,

    /// Maximum number of transport fetches running at the same time.
    pub max_concurrent_fetches: usize,

    /// Fetch timeouts.
    pub timeouts: DownloadTimeouts,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            cache_first_sync: true,
            max_concurrent_fetches: 6,
            timeouts: DownloadTimeouts::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The directory of the disk tier, if the disk tier is enabled.
    pub fn disk_cache_dir(&self) -> Option<&Path> {
        self.cache_dir
            .as_deref()
            .filter(|_| self.caches.persist_to_disk)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
