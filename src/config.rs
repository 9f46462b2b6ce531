//! Configuration management
//!
//! ```yaml
//! source:
//!   endpoint: "unix:///tmp/agent.sock"
//!   initial_fetch_timeout: 3s
//!   expected_id: "spiffe://example.org/server"
//!   degraded_policy: serve_last_known
//!   backoff:
//!     initial_interval: 500ms
//!     max_interval: 30s
//!     multiplier: 2.0
//!     jitter: 0.5
//! policy:
//!   exact: "spiffe://example.org/client"
//! log:
//!   level: info
//!   format: json
//! ```

use std::path::Path;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::matcher::Matcher;
use crate::spiffe_id::SpiffeId;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity source settings
    pub source: SourceConfig,
    /// Peer authorization policy
    pub policy: Matcher,
    /// Logging settings
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a YAML file and `WORKLOAD_MTLS_` environment
    /// variables (`__` separates nested keys, e.g.
    /// `WORKLOAD_MTLS_SOURCE__ENDPOINT`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file is missing, a value fails to
    /// deserialise, or the result is inconsistent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("WORKLOAD_MTLS_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.source.validate()?;

        Ok(config)
    }
}

/// Identity source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Workload API address; `SPIFFE_ENDPOINT_SOCKET` when unset
    pub endpoint: Option<String>,
    /// How long `open` waits for the first update
    #[serde(with = "humantime_serde")]
    pub initial_fetch_timeout: Duration,
    /// SVID to present when the agent provides several
    pub expected_id: Option<SpiffeId>,
    /// Retry timing for the background refresh
    pub backoff: BackoffConfig,
    /// Behaviour once refresh has stopped for good
    pub degraded_policy: DegradedPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            initial_fetch_timeout: Duration::from_secs(3),
            expected_id: None,
            backoff: BackoffConfig::default(),
            degraded_policy: DegradedPolicy::default(),
        }
    }
}

impl SourceConfig {
    /// Defaults with an explicit endpoint
    #[must_use]
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.initial_fetch_timeout.is_zero() {
            return Err(Error::Config(
                "source.initial_fetch_timeout must be greater than zero".to_owned(),
            ));
        }
        self.backoff.validate()
    }
}

/// Exponential backoff with jitter for refresh retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    /// Delay cap, applied after jitter
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Randomisation factor in `[0, 1]`; each delay is drawn from
    /// `delay * (1 ± jitter)`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Create an exponential backoff instance
    ///
    /// Retries never give up on their own; the source stops on terminal
    /// errors or `close()`.
    #[must_use]
    pub fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            randomization_factor: self.jitter,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Next retry delay from `backoff`, never above `max_interval`
    ///
    /// `ExponentialBackoff` randomises after capping, so its raw delays can
    /// reach `max_interval * (1 + jitter)`.
    pub fn next_delay(&self, backoff: &mut ExponentialBackoff) -> Duration {
        backoff
            .next_backoff()
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    fn validate(&self) -> Result<()> {
        if self.initial_interval.is_zero() || self.initial_interval > self.max_interval {
            return Err(Error::Config(format!(
                "backoff.initial_interval must be in (0, max_interval], got {:?} with max {:?}",
                self.initial_interval, self.max_interval
            )));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "backoff.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config(format!(
                "backoff.jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// What a source does after its refresh task stopped on a terminal error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Keep handshaking with the last good SVID and bundles
    #[default]
    ServeLastKnown,
    /// Fail new handshakes; established connections are left alone
    RejectNewHandshakes,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// `json` for structured output, anything else for text
    pub format: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: None,
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "500ms")
    ///
    /// Uses the largest unit that represents the value exactly, down to "ns".
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else if duration.subsec_nanos() % 1_000_000 == 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}ns", duration.as_nanos()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "1500ns")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<Duration, String> {
        // "ns" and "ms" before "s" and "m"
        if let Some(ns) = s.strip_suffix("ns") {
            let ns = number::<u128>(ns)?;
            let secs = u64::try_from(ns / 1_000_000_000).map_err(|_| overflow(s))?;
            let nanos = u32::try_from(ns % 1_000_000_000).map_err(|_| overflow(s))?;
            Ok(Duration::new(secs, nanos))
        } else if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(number(mins)?, 60, s)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(number(hours)?, 3600, s)
        } else {
            // Assume seconds
            number(s).map(Duration::from_secs)
        }
    }

    fn number<T: std::str::FromStr<Err = std::num::ParseIntError>>(s: &str) -> Result<T, String> {
        s.trim().parse::<T>().map_err(|e| e.to_string())
    }

    fn scaled(value: u64, unit_secs: u64, s: &str) -> Result<Duration, String> {
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| overflow(s))
    }

    fn overflow(s: &str) -> String {
        format!("duration {s:?} is out of range")
    }
}
