//! Configuration for connectivity tracking.
//!
//! `ConnectivityConfig` is loaded from the client's JSON configuration file and
//! is read-only afterwards. `RedialConfig` carries the backoff schedule used
//! while talking to the network-management service; tests swap it for
//! [`RedialConfig::immediate`].

use crate::error::{ConnError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

/// NetworkManager property and signal names.
pub struct BusConfig;

impl BusConfig {
    pub const STATE_PROPERTY: &'static str = "State";
    pub const PRIMARY_CONNECTION_PROPERTY: &'static str = "PrimaryConnection";
    pub const STATE_CHANGED_SIGNAL: &'static str = "StateChanged";
    pub const PROPERTIES_CHANGED_SIGNAL: &'static str = "PropertiesChanged";
}

/// Limits for the reachability check.
pub struct WebcheckConfig;

impl WebcheckConfig {
    /// Check pages are tiny; anything larger is treated as a portal page.
    pub const MAX_BODY_BYTES: usize = 1024;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const USER_AGENT: &'static str = concat!("pushconn/", env!("CARGO_PKG_VERSION"));
}

/// Configuration of the connectivity state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// URL fetched by the reachability check.
    pub connectivity_check_url: String,
    /// Expected MD5 of the check page, as hex.
    pub connectivity_check_md5: String,
    /// Delay before checking again after a verdict.
    #[serde(with = "duration_str")]
    pub recheck_timeout: Duration,
    /// Delay between a link change and the first check.
    #[serde(with = "duration_str", default)]
    pub stabilizing_timeout: Duration,
    /// HTTP client timeout for the check.
    #[serde(with = "duration_str", default = "default_webcheck_timeout")]
    pub webcheck_timeout: Duration,
}

fn default_webcheck_timeout() -> Duration {
    WebcheckConfig::DEFAULT_TIMEOUT
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            connectivity_check_url: String::new(),
            connectivity_check_md5: String::new(),
            recheck_timeout: Duration::from_secs(600),
            stabilizing_timeout: Duration::ZERO,
            webcheck_timeout: WebcheckConfig::DEFAULT_TIMEOUT,
        }
    }
}

impl ConnectivityConfig {
    /// Parse and validate a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConnError::Io {
            message: format!("reading {}: {}", path.display(), e),
            source: Some(e),
        })?;
        Self::from_json(&text)
    }

    /// Check that the URL is usable and the hash looks like an MD5 digest.
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.connectivity_check_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConnError::config(format!(
                "connectivity_check_url must be http or https, got {}",
                url.scheme()
            )));
        }

        let md5 = &self.connectivity_check_md5;
        if md5.len() != 32 || !md5.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConnError::config(format!(
                "connectivity_check_md5 must be 32 hex characters, got {:?}",
                md5
            )));
        }

        if self.recheck_timeout.is_zero() {
            return Err(ConnError::config("recheck_timeout must be positive"));
        }

        Ok(())
    }
}

/// Backoff schedule for redialing the bus and retrying watcher startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedialConfig {
    /// Delay after the n-th failure; the last entry repeats.
    pub timeouts: Vec<Duration>,
    /// Upper bound of the jitter spread added to each delay.
    pub max_jitter: Duration,
    /// Give up after this many attempts (`None` retries forever).
    pub max_attempts: Option<u32>,
    /// Pause between failed startup rounds of the state machine.
    pub restart_cooldown: Duration,
}

impl Default for RedialConfig {
    fn default() -> Self {
        let timeouts = [0, 1, 2, 5, 11, 19, 37, 67, 113, 191]
            .into_iter()
            .map(Duration::from_secs)
            .collect();
        Self {
            timeouts,
            max_jitter: Duration::from_secs(10),
            max_attempts: None,
            restart_cooldown: Duration::from_millis(10),
        }
    }
}

impl RedialConfig {
    /// A schedule that never sleeps. Used by tests.
    pub fn immediate() -> Self {
        Self {
            timeouts: vec![Duration::ZERO],
            max_jitter: Duration::ZERO,
            max_attempts: None,
            restart_cooldown: Duration::ZERO,
        }
    }

    /// Replace the backoff schedule.
    pub fn with_timeouts(mut self, timeouts: Vec<Duration>) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the jitter bound.
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Bound the number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Base delay after the given number of failed attempts.
    ///
    /// # Panics
    ///
    /// Panics if the schedule is empty.
    pub fn timeout_for(&self, failures: u32) -> Duration {
        assert!(!self.timeouts.is_empty(), "redial schedule must not be empty");
        let idx = (failures as usize).min(self.timeouts.len() - 1);
        self.timeouts[idx]
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Parse a duration written as `<number><unit>` groups, e.g. `"1m30s"`.
///
/// Units: `ns`, `us`, `ms`, `s`, `m`, `h`. A bare `"0"` is accepted.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(ConnError::config("empty duration"));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| ConnError::config(format!("missing unit in duration {:?}", text)))?;
        if digits == 0 {
            return Err(ConnError::config(format!("invalid duration {:?}", text)));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| ConnError::config(format!("invalid number in duration {:?}", text)))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => {
                return Err(ConnError::config(format!(
                    "unknown unit {:?} in duration {:?}",
                    unit, text
                )))
            }
        };
        rest = &rest[unit_len..];
        total += Duration::from_nanos((value * nanos_per_unit).round() as u64);
    }

    Ok(total)
}

/// Render a duration in the same grammar `parse_duration` accepts.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos % 1_000_000_000 == 0 {
        let secs = duration.as_secs();
        if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}ns", nanos)
    }
}

mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
