//! Configuration types for clients, commands and tunnels.
//!
//! [`ClientConfig`] collects every tunable of the transport layer. Values
//! come from code (builder methods), from `NODE_SSH_*` environment variables
//! ([`env`]) or from a TOML file ([`file`]).

pub mod env;
pub mod file;

use std::time::Duration;

use crate::transport::{HostKeyVerification, KeepaliveConfig, RetryStrategy};

/// Upload directory used when a script runs under sudo.
pub const DEFAULT_SUDO_UPLOAD_DIR: &str = "/opt/deckhouse/tmp";

/// Upload directory used otherwise (the login directory).
pub const DEFAULT_UPLOAD_DIR: &str = ".";

/// Configuration of a [`Client`](crate::transport::Client) and of everything
/// created from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Timeout for a single TCP connect plus handshake.
    pub connect_timeout: Duration,
    /// Retry policy for dialing the target and the bastion.
    pub dial_retry: RetryStrategy,
    /// Retry policy for opening a session channel.
    pub session_retry: RetryStrategy,
    /// Keep-alive probing.
    pub keepalive: KeepaliveConfig,
    /// Server host key policy.
    pub host_key_verification: HostKeyVerification,
    /// Time between SIGINT and SIGKILL when stopping a command.
    pub stop_grace: Duration,
    /// Where scripts are uploaded.
    pub upload_dir: String,
    /// Where scripts are uploaded when they run under sudo.
    pub sudo_upload_dir: String,
    /// Reverse tunnel health monitor.
    pub health: HealthMonitorConfig,
    /// Bundle runner.
    pub bundle: BundleConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            dial_retry: RetryStrategy::fixed(Duration::from_secs(5), 5),
            session_retry: RetryStrategy::fixed(Duration::from_secs(5), 10),
            keepalive: KeepaliveConfig::default(),
            host_key_verification: HostKeyVerification::default(),
            stop_grace: Duration::from_secs(2),
            upload_dir: DEFAULT_UPLOAD_DIR.to_string(),
            sudo_upload_dir: DEFAULT_SUDO_UPLOAD_DIR.to_string(),
            health: HealthMonitorConfig::default(),
            bundle: BundleConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `NODE_SSH_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        env::EnvConfig::default().apply(Self::default())
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the dial retry policy.
    #[must_use]
    pub const fn dial_retry(mut self, strategy: RetryStrategy) -> Self {
        self.dial_retry = strategy;
        self
    }

    /// Set the session-open retry policy.
    #[must_use]
    pub const fn session_retry(mut self, strategy: RetryStrategy) -> Self {
        self.session_retry = strategy;
        self
    }

    /// Set keep-alive probing.
    #[must_use]
    pub const fn keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the host key policy.
    #[must_use]
    pub const fn host_key_verification(mut self, policy: HostKeyVerification) -> Self {
        self.host_key_verification = policy;
        self
    }

    /// Set the SIGINT to SIGKILL grace period.
    #[must_use]
    pub const fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the script upload directory.
    #[must_use]
    pub fn upload_dir(mut self, dir: impl Into<String>) -> Self {
        self.upload_dir = dir.into();
        self
    }

    /// Set the script upload directory used under sudo.
    #[must_use]
    pub fn sudo_upload_dir(mut self, dir: impl Into<String>) -> Self {
        self.sudo_upload_dir = dir.into();
        self
    }

    /// Set the health monitor configuration.
    #[must_use]
    pub const fn health(mut self, health: HealthMonitorConfig) -> Self {
        self.health = health;
        self
    }

    /// Set the bundle runner configuration.
    #[must_use]
    pub fn bundle(mut self, bundle: BundleConfig) -> Self {
        self.bundle = bundle;
        self
    }
}

/// Reverse tunnel health monitor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMonitorConfig {
    /// Interval between checks.
    pub interval: Duration,
    /// Attempts per check before it is declared failed.
    pub check_retries: u32,
    /// Pause between attempts of one check.
    pub retry_delay: Duration,
    /// Restarts in a row after which the monitor gives up.
    pub max_restarts: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            check_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_restarts: 20,
        }
    }
}

impl HealthMonitorConfig {
    /// Create new config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set check interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set attempts per check.
    #[must_use]
    pub const fn check_retries(mut self, retries: u32) -> Self {
        self.check_retries = retries;
        self
    }

    /// Set pause between attempts of one check.
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the restart ceiling.
    #[must_use]
    pub const fn max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }
}

/// Bundle runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleConfig {
    /// Consecutive failures of one step tolerated before giving up.
    pub max_step_failures: u32,
    /// Script inside the bundle directory that runs the steps.
    pub entrypoint: String,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            max_step_failures: 10,
            entrypoint: "bashible.sh".to_string(),
        }
    }
}

/// Configuration for [`logging::init`](crate::logging::init).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub directive: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Include the event target (module path).
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directive: "info".to_string(),
            json: false,
            with_target: false,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default filter directive.
    #[must_use]
    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = directive.into();
        self
    }

    /// Enable JSON output.
    #[must_use]
    pub const fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Include event targets.
    #[must_use]
    pub const fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.session_retry.max_attempts(), 10);
        assert_eq!(config.upload_dir, ".");
        assert_eq!(config.sudo_upload_dir, DEFAULT_SUDO_UPLOAD_DIR);
        assert_eq!(config.bundle.max_step_failures, 10);
        assert_eq!(config.bundle.entrypoint, "bashible.sh");
    }

    #[test]
    fn builder_chain() {
        let config = ClientConfig::new()
            .stop_grace(Duration::from_millis(100))
            .sudo_upload_dir("/var/tmp")
            .health(HealthMonitorConfig::new().max_restarts(3));
        assert_eq!(config.stop_grace, Duration::from_millis(100));
        assert_eq!(config.sudo_upload_dir, "/var/tmp");
        assert_eq!(config.health.max_restarts, 3);
    }
}
