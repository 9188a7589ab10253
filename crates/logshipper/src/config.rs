// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::address::DEFAULT_PORT;
use crate::backoff::{DEFAULT_BACKOFF_CEILING, DEFAULT_BACKOFF_FLOOR};
use crate::buffer::OverflowPolicy;
use crate::errors::ConfigError;
use crate::peers::PeerRing;

/// How long the delivery loop waits before polling an empty buffer again.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// What the delivery loop does after a record could not be written.
///
/// The record itself is lost either way: it left the buffer before the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteFailurePolicy {
    /// Back off, rotate to the next peer and keep delivering.
    #[default]
    Recover,
    /// Stop the delivery loop for good. Producers can keep writing, but
    /// nothing is delivered again.
    Stop,
}

impl FromStr for WriteFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "recover" => Ok(WriteFailurePolicy::Recover),
            "stop" => Ok(WriteFailurePolicy::Stop),
            other => Err(ConfigError::Invalid(format!(
                "unknown write failure policy '{other}', expected recover or stop"
            ))),
        }
    }
}

/// Configuration for a [`crate::shipper::Shipper`].
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Peer specs, e.g. `collector:7651` or `tcp+dnssrv://_logs._tcp.example.com`
    pub peers: Vec<String>,
    /// Port applied to peer specs that do not name one
    pub default_port: u16,
    /// Static text written before every record
    pub prefix: Option<String>,
    /// Sleep between polls of an empty buffer
    pub idle_interval: Duration,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    /// Reset the backoff after every successful write
    pub reset_backoff_on_success: bool,
    pub write_failure: WriteFailurePolicy,
    /// Maximum number of queued records, `None` for unbounded
    pub buffer_capacity: Option<usize>,
    pub overflow: OverflowPolicy,
    pub lookup_timeout: Duration,
    pub dial_timeout: Duration,
    pub write_timeout: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            default_port: DEFAULT_PORT,
            prefix: None,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            backoff_floor: DEFAULT_BACKOFF_FLOOR,
            backoff_ceiling: DEFAULT_BACKOFF_CEILING,
            reset_backoff_on_success: false,
            write_failure: WriteFailurePolicy::default(),
            buffer_capacity: None,
            overflow: OverflowPolicy::default(),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(format!("{key} has an invalid value '{raw}'")))
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse_value::<u64>(key, raw).map(Duration::from_millis)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid(format!(
            "{key} has an invalid value '{raw}'"
        ))),
    }
}

impl ShipperConfig {
    /// A default configuration shipping to `peers`.
    pub fn with_peers<S: Into<String>>(peers: impl IntoIterator<Item = S>) -> Self {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Create configuration from `LOGSHIP_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup, unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(peers) = lookup("LOGSHIP_PEERS") {
            config.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(port) = lookup("LOGSHIP_DEFAULT_PORT") {
            config.default_port = parse_value("LOGSHIP_DEFAULT_PORT", &port)?;
        }
        config.prefix = lookup("LOGSHIP_PREFIX").filter(|prefix| !prefix.is_empty());
        if let Some(level) = lookup("LOGSHIP_LOG_LEVEL") {
            config.log_level = level.trim().to_lowercase();
        }
        if let Some(capacity) = lookup("LOGSHIP_BUFFER_CAPACITY") {
            config.buffer_capacity = Some(parse_value("LOGSHIP_BUFFER_CAPACITY", &capacity)?);
        }
        if let Some(policy) = lookup("LOGSHIP_OVERFLOW_POLICY") {
            config.overflow = policy.parse()?;
        }
        if let Some(policy) = lookup("LOGSHIP_WRITE_FAILURE_POLICY") {
            config.write_failure = policy.parse()?;
        }
        if let Some(reset) = lookup("LOGSHIP_RESET_BACKOFF_ON_SUCCESS") {
            config.reset_backoff_on_success =
                parse_bool("LOGSHIP_RESET_BACKOFF_ON_SUCCESS", &reset)?;
        }
        if let Some(ms) = lookup("LOGSHIP_IDLE_INTERVAL_MS") {
            config.idle_interval = parse_millis("LOGSHIP_IDLE_INTERVAL_MS", &ms)?;
        }
        if let Some(ms) = lookup("LOGSHIP_LOOKUP_TIMEOUT_MS") {
            config.lookup_timeout = parse_millis("LOGSHIP_LOOKUP_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("LOGSHIP_DIAL_TIMEOUT_MS") {
            config.dial_timeout = parse_millis("LOGSHIP_DIAL_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("LOGSHIP_WRITE_TIMEOUT_MS") {
            config.write_timeout = parse_millis("LOGSHIP_WRITE_TIMEOUT_MS", &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, including every peer spec.
    pub fn validate(&self) -> Result<(), ConfigError> {
        PeerRing::from_specs(&self.peers, self.default_port)?;

        if self.default_port == 0 {
            return Err(ConfigError::Invalid(
                "default port must be greater than 0".to_string(),
            ));
        }

        if self.buffer_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "buffer capacity must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("idle interval", self.idle_interval),
            ("backoff floor", self.backoff_floor),
            ("lookup timeout", self.lookup_timeout),
            ("dial timeout", self.dial_timeout),
            ("write timeout", self.write_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }

        if self.backoff_ceiling < self.backoff_floor {
            return Err(ConfigError::Invalid(
                "backoff ceiling must not be below the floor".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}
