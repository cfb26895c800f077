//! File-based configuration loading.
//!
//! ```toml
//! connect_timeout = 30
//! stop_grace_ms = 2000
//! sudo_upload_dir = "/opt/deckhouse/tmp"
//!
//! [dial]
//! attempts = 5
//! delay = 5
//!
//! [keepalive]
//! interval = 15
//!
//! [health]
//! interval = 5
//! max_restarts = 20
//! ```
//!
//! Durations are whole seconds unless the key ends in `_ms`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::ClientConfig;
use crate::error::{NodeError, Result};
use crate::transport::{HostKeyVerification, RetryStrategy};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    connect_timeout: Option<u64>,
    stop_grace_ms: Option<u64>,
    upload_dir: Option<String>,
    sudo_upload_dir: Option<String>,
    host_key_verification: Option<String>,
    dial: Option<RetrySection>,
    session: Option<RetrySection>,
    keepalive: Option<KeepaliveSection>,
    health: Option<HealthSection>,
    bundle: Option<BundleSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrySection {
    attempts: Option<u32>,
    delay: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeepaliveSection {
    enabled: Option<bool>,
    interval: Option<u64>,
    response_timeout: Option<u64>,
    max_missed: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthSection {
    interval: Option<u64>,
    check_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    max_restarts: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BundleSection {
    max_step_failures: Option<u32>,
    entrypoint: Option<String>,
}

impl RetrySection {
    fn apply(&self, current: &RetryStrategy) -> RetryStrategy {
        let (delay, attempts) = match current {
            RetryStrategy::None => (Duration::ZERO, 1),
            RetryStrategy::Fixed {
                delay,
                max_attempts,
            } => (*delay, *max_attempts),
        };
        RetryStrategy::fixed(
            self.delay.map_or(delay, Duration::from_secs),
            self.attempts.unwrap_or(attempts),
        )
    }
}

fn parse_host_key_verification(value: &str) -> Result<HostKeyVerification> {
    match value.to_lowercase().as_str() {
        "tofu" => Ok(HostKeyVerification::Tofu),
        "known_hosts" | "known-hosts" => Ok(HostKeyVerification::KnownHosts),
        "reject_unknown" | "reject-unknown" => Ok(HostKeyVerification::RejectUnknown),
        #[cfg(feature = "insecure-skip-verify")]
        "accept_all" | "accept-all" => Ok(HostKeyVerification::AcceptAll),
        other => Err(NodeError::config(format!(
            "unknown host_key_verification '{other}'"
        ))),
    }
}

/// Parse TOML text on top of the defaults.
pub fn from_toml_str(content: &str) -> Result<ClientConfig> {
    let file: FileConfig =
        toml::from_str(content).map_err(|e| NodeError::config(format!("invalid TOML: {e}")))?;
    let mut config = ClientConfig::default();

    if let Some(secs) = file.connect_timeout {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = file.stop_grace_ms {
        config.stop_grace = Duration::from_millis(ms);
    }
    if let Some(dir) = file.upload_dir {
        config.upload_dir = dir;
    }
    if let Some(dir) = file.sudo_upload_dir {
        config.sudo_upload_dir = dir;
    }
    if let Some(policy) = file.host_key_verification {
        config.host_key_verification = parse_host_key_verification(&policy)?;
    }
    if let Some(dial) = file.dial {
        config.dial_retry = dial.apply(&config.dial_retry);
    }
    if let Some(session) = file.session {
        config.session_retry = session.apply(&config.session_retry);
    }
    if let Some(k) = file.keepalive {
        if let Some(enabled) = k.enabled {
            config.keepalive.enabled = enabled;
        }
        if let Some(secs) = k.interval {
            config.keepalive.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = k.response_timeout {
            config.keepalive.response_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = k.max_missed {
            config.keepalive.max_missed = n;
        }
    }
    if let Some(h) = file.health {
        if let Some(secs) = h.interval {
            config.health.interval = Duration::from_secs(secs);
        }
        if let Some(n) = h.check_retries {
            config.health.check_retries = n;
        }
        if let Some(ms) = h.retry_delay_ms {
            config.health.retry_delay = Duration::from_millis(ms);
        }
        if let Some(n) = h.max_restarts {
            config.health.max_restarts = n;
        }
    }
    if let Some(b) = file.bundle {
        if let Some(n) = b.max_step_failures {
            config.bundle.max_step_failures = n;
        }
        if let Some(entrypoint) = b.entrypoint {
            config.bundle.entrypoint = entrypoint;
        }
    }

    Ok(config)
}

/// Load a TOML configuration file.
pub fn load(path: &Path) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| NodeError::io_context(format!("failed to read {}", path.display()), e))?;
    from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(from_toml_str("").unwrap(), ClientConfig::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = from_toml_str(
            r#"
            connect_timeout = 7
            sudo_upload_dir = "/var/tmp/install"
            host_key_verification = "known_hosts"

            [dial]
            attempts = 2

            [keepalive]
            enabled = false

            [health]
            max_restarts = 4
            retry_delay_ms = 10

            [bundle]
            entrypoint = "run.sh"
            "#,
        )
        .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(7));
        assert_eq!(config.sudo_upload_dir, "/var/tmp/install");
        assert_eq!(config.host_key_verification, HostKeyVerification::KnownHosts);
        assert_eq!(config.dial_retry.max_attempts(), 2);
        assert!(!config.keepalive.enabled);
        assert_eq!(config.health.max_restarts, 4);
        assert_eq!(config.health.retry_delay, Duration::from_millis(10));
        assert_eq!(config.bundle.entrypoint, "run.sh");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = from_toml_str("bogus = 1").unwrap_err();
        assert!(err.to_string().contains("invalid TOML"));
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = from_toml_str("host_key_verification = \"whatever\"").unwrap_err();
        assert!(err.to_string().contains("whatever"));
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-ssh.toml");
        std::fs::write(&path, "stop_grace_ms = 50\n").unwrap();
        assert_eq!(load(&path).unwrap().stop_grace, Duration::from_millis(50));
        assert!(load(&dir.path().join("missing.toml")).is_err());
    }
}
