//! Environment-based configuration.
//!
//! Every variable is prefixed (`NODE_SSH_` by default). Durations are whole
//! seconds unless the name ends in `_MS`.

use std::collections::HashMap;
use std::time::Duration;

use super::ClientConfig;
use crate::transport::RetryStrategy;

/// Environment configuration prefix.
pub const DEFAULT_PREFIX: &str = "NODE_SSH";

/// Environment variable reader.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: String,
    /// Values used instead of the process environment.
    overrides: Option<HashMap<String, String>>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl EnvConfig {
    /// Create a new environment config reader.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            overrides: None,
        }
    }

    /// Read from `vars` (full variable names) instead of the process environment.
    #[must_use]
    pub fn from_map(prefix: impl Into<String>, vars: HashMap<String, String>) -> Self {
        Self {
            prefix: prefix.into(),
            overrides: Some(vars),
        }
    }

    fn var_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_uppercase()
        } else {
            format!("{}_{}", self.prefix, name.to_uppercase())
        }
    }

    /// Get a string value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        let var = self.var_name(name);
        match &self.overrides {
            Some(map) => map.get(&var).cloned(),
            None => std::env::var(&var).ok(),
        }
    }

    /// Get a parsed value.
    #[must_use]
    pub fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// Get a boolean value (`1/true/yes/on` or `0/false/no/off`).
    #[must_use]
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name)
            .and_then(|v| match v.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            })
    }

    /// Get a duration in seconds.
    #[must_use]
    pub fn duration_secs(&self, name: &str) -> Option<Duration> {
        self.parse::<u64>(name).map(Duration::from_secs)
    }

    /// Get a duration in milliseconds.
    #[must_use]
    pub fn duration_millis(&self, name: &str) -> Option<Duration> {
        self.parse::<u64>(name).map(Duration::from_millis)
    }

    /// Overlay the variables that are set onto `config`.
    #[must_use]
    pub fn apply(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(d) = self.duration_secs("CONNECT_TIMEOUT") {
            config.connect_timeout = d;
        }
        config.dial_retry = self.retry("DIAL", config.dial_retry);
        config.session_retry = self.retry("SESSION", config.session_retry);
        if let Some(d) = self.duration_secs("KEEPALIVE_INTERVAL") {
            config.keepalive.interval = d;
        }
        if let Some(n) = self.parse("KEEPALIVE_MAX_MISSED") {
            config.keepalive.max_missed = n;
        }
        if let Some(enabled) = self.bool("KEEPALIVE") {
            config.keepalive.enabled = enabled;
        }
        if let Some(d) = self.duration_millis("STOP_GRACE_MS") {
            config.stop_grace = d;
        }
        if let Some(dir) = self.get("UPLOAD_DIR") {
            config.upload_dir = dir;
        }
        if let Some(dir) = self.get("SUDO_UPLOAD_DIR") {
            config.sudo_upload_dir = dir;
        }
        if let Some(d) = self.duration_secs("HEALTH_INTERVAL") {
            config.health.interval = d;
        }
        if let Some(n) = self.parse("HEALTH_MAX_RESTARTS") {
            config.health.max_restarts = n;
        }
        if let Some(n) = self.parse("BUNDLE_MAX_STEP_FAILURES") {
            config.bundle.max_step_failures = n;
        }
        config
    }

    fn retry(&self, name: &str, current: RetryStrategy) -> RetryStrategy {
        let attempts = self.parse::<u32>(&format!("{name}_ATTEMPTS"));
        let delay = self.duration_secs(&format!("{name}_DELAY"));
        if attempts.is_none() && delay.is_none() {
            return current;
        }
        let (cur_delay, cur_attempts) = match current {
            RetryStrategy::None => (Duration::ZERO, 1),
            RetryStrategy::Fixed {
                delay,
                max_attempts,
            } => (delay, max_attempts),
        };
        RetryStrategy::fixed(delay.unwrap_or(cur_delay), attempts.unwrap_or(cur_attempts))
    }
}
