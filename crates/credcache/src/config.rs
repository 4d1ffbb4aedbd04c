use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
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
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
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
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "credcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Sizing and expiry of a credential cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of entries kept in the store.
    pub capacity: usize,

    /// How often expired entries are swept from the store.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Expiration of entries that are set without an explicit one.
    ///
    /// `None` means that such entries never expire.
    #[serde(with = "humantime_serde")]
    pub default_expiration: Option<Duration>,

    /// Upper bound for how long a token is cached, regardless of its own lifetime.
    #[serde(with = "humantime_serde")]
    pub max_token_duration: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            cleanup_interval: Duration::from_secs(30),
            default_expiration: None,
            max_token_duration: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The credential cache.
    pub cache: StoreConfig,
}

impl Config {
    /// Loads the configuration from the given YAML file, or returns the defaults without one.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
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

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache, StoreConfig::default());
        assert_eq!(cfg.cache.capacity, 1024);

        // Individual settings can be given in reasonable units without touching the others.
        let yaml = r#"
            cache:
              cleanup_interval: 5m
              max_token_duration: 15m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.cleanup_interval, Duration::from_secs(300));
        assert_eq!(cfg.cache.max_token_duration, Duration::from_secs(900));
        assert_eq!(cfg.cache.capacity, 1024);
        assert_eq!(cfg.cache.default_expiration, None);
    }

    #[test]
    fn test_default_expiration() {
        let yaml = r#"
            cache:
              capacity: 16
              default_expiration: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.capacity, 16);
        assert_eq!(
            cfg.cache.default_expiration,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_logging() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_metrics_and_sentry() {
        let yaml = r#"
            metrics:
              statsd: 127.0.0.1:8125
              prefix: flux.credcache
              custom_tags:
                cluster: staging
            sentry_dsn: https://public@sentry.example.com/42
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.metrics.statsd.as_deref(), Some("127.0.0.1:8125"));
        assert_eq!(cfg.metrics.prefix, "flux.credcache");
        assert_eq!(
            cfg.metrics.custom_tags,
            BTreeMap::from([("cluster".to_owned(), "staging".to_owned())])
        );
        let dsn = cfg.sentry_dsn.unwrap();
        assert_eq!(dsn.host(), "sentry.example.com");
        assert_eq!(dsn.public_key(), "public");

        let yaml = r#"
            metrics:
              custom_tags:
                cluster: staging
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.metrics.prefix, "credcache");
        assert!(cfg.sentry_dsn.is_none());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            cache:
              not_a_setting: 1h
            bind: 127.0.0.1:3021
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_config_file() {
        let file = credcache_test::tempfile("cache:\n  capacity: 8\n");
        let cfg = Config::get(Some(file.path())).unwrap();
        assert_eq!(cfg.cache.capacity, 8);

        let err = Config::get(Some(Path::new("/nonexistent/credcache.yml"))).unwrap_err();
        assert_eq!(err.to_string(), "failed to open configuration file");
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
