use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Output format of the human facing logger.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty when stderr is a terminal, simplified otherwise.
    Auto,
    /// Multi-line, colored output.
    Pretty,
    /// One line per event, no colors.
    Simplified,
    /// JSON lines, one object per event.
    Json,
}

/// Logging settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The default level, unless `RUST_LOG` says otherwise.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Forces `RUST_BACKTRACE` on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Where and how metrics are reported.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of a statsd server. Metrics are discarded when unset.
    pub statsd: Option<String>,
    /// Prefix of every metric name.
    pub prefix: String,
    /// Name of a tag carrying the hostname, added to every metric when set.
    pub hostname_tag: Option<String>,
    /// Tags added to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "cubecache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Capacities of the bounded caches.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Maximum number of simultaneously open data sources.
    pub source_handles: u64,
    /// Maximum number of decoded tiles kept per open source.
    pub tiles: u64,
    /// Bytes shared by all open sources for holding whole cubes in memory.
    ///
    /// A source whose full cube fits into what is left of this budget switches its plane cache
    /// into whole-cube mode, making channel changes free. `0` disables whole-cube mode.
    pub full_cube_budget: u64,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            source_handles: 25,
            tiles: 4096,
            full_cube_budget: 0,
        }
    }
}

/// Tuning of the progressive computations.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComputeConfig {
    /// How many computation jobs may run at the same time.
    pub max_concurrent_jobs: usize,
    /// The upper bound of pixels read in one slice.
    ///
    /// This bounds how long a job holds the source lock, and with that the latency of
    /// cancellation and of reads by other jobs.
    pub max_slice_pixels: usize,
    /// Weight of the row-span cost when choosing between direct and swizzled access.
    ///
    /// Swizzled access is used when `rows * channels > swizzle_crossover * row_span`.
    pub swizzle_crossover: f64,
    /// How long [`shutdown`](crate::services::CubeService::shutdown) waits for running jobs.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_slice_pixels: 1 << 20,
            swizzle_crossover: 1.0,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configures the logging.
    pub logging: Logging,

    /// Configures the statsd metrics.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Capacities of the caches.
    pub caches: CacheConfigs,

    /// Tuning of the computations.
    pub compute: ComputeConfig,
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
}

const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// Accepts the lowercase level names only, not the numeric levels `LevelFilter` would parse.
fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    if !LEVELS.contains(&level.as_str()) {
        return Err(de::Error::unknown_variant(&level, LEVELS));
    }
    level
        .parse()
        .map_err(|_| de::Error::unknown_variant(&level, LEVELS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        // Setting one capacity keeps the defaults of the others.
        let yaml = r#"
            caches:
              tiles: 128
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.tiles, 128);
        assert_eq!(cfg.caches.source_handles, 25);
        assert_eq!(cfg.caches.full_cube_budget, 0);
        assert_eq!(cfg.compute, ComputeConfig::default());
    }

    #[test]
    fn test_compute_config() {
        let yaml = r#"
            compute:
              max_slice_pixels: 4096
              swizzle_crossover: 2.5
              shutdown_timeout: 500ms
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.compute.max_slice_pixels, 4096);
        assert_eq!(cfg.compute.swizzle_crossover, 2.5);
        assert_eq!(cfg.compute.shutdown_timeout, Duration::from_millis(500));
        assert_eq!(cfg.compute.max_concurrent_jobs, 4);
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_cache: 1
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let result = Config::from_reader("".as_bytes());
        assert!(result.is_err());
    }
}
