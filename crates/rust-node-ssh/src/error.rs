//! Error types for rust-node-ssh.
//!
//! Errors carry the remote host, the command and the underlying cause so an
//! operator can act on them without reading source. Connection problems,
//! remote exit statuses, privilege-escalation failures and tunnel failures
//! are separate variants so callers can branch on them.

use std::time::Duration;

use thiserror::Error;

/// Maximum number of stderr bytes rendered in error messages.
const MAX_STDERR_DISPLAY: usize = 500;

/// Exit status reported by scripts that reboot the node they run on.
pub const REBOOT_EXIT_STATUS: u32 = 255;

/// Render captured stderr for display, keeping the tail when it is long.
fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim_end();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.len() <= MAX_STDERR_DISPLAY {
        return format!("\nstderr:\n{trimmed}");
    }
    let mut start = trimmed.len() - MAX_STDERR_DISPLAY;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("\nstderr (truncated):\n...{}", &trimmed[start..])
}

fn format_exit(err: &ExitError) -> String {
    let status = match (&err.status, &err.signal) {
        (Some(code), _) => format!("process exited with status {code}"),
        (None, Some(signal)) => format!("process killed by signal {signal}"),
        (None, None) => "process exited without status".to_string(),
    };
    format!(
        "{status} (host {}, command `{}`){}",
        err.host,
        err.command,
        format_stderr(&err.stderr)
    )
}

/// The main error type for rust-node-ssh operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Establishing or using the SSH connection failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The remote process exited with a non-zero status.
    #[error(transparent)]
    Exit(#[from] ExitError),

    /// `sudo` kept asking for the password: the become password is wrong.
    #[error(
        "sudo rejected the become password on {host} after {attempts} prompts \
         (command `{command}`); check the become password and the sudoers configuration{}",
        format_stderr(stderr)
    )]
    BecomeRejected {
        /// Host the command ran on.
        host: String,
        /// The command that was wrapped in sudo.
        command: String,
        /// How many times the password prompt was seen.
        attempts: u32,
        /// Everything the process wrote to stderr.
        stderr: String,
    },

    /// The command was stopped by its own timeout watcher.
    #[error("command `{command}` killed after timeout of {after:?}")]
    Killed {
        /// The command line.
        command: String,
        /// The configured timeout.
        after: Duration,
    },

    /// The command was stopped through its cancellation token.
    #[error("command `{command}` cancelled")]
    Cancelled {
        /// The command line.
        command: String,
    },

    /// A tunnel operation failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// A bundle step was retried more times than allowed.
    #[error("bundle step `{step}` failed {failures} times in a row, giving up")]
    BundleTimeout {
        /// Step path as printed by the bundle.
        step: String,
        /// Consecutive failures observed.
        failures: u32,
    },

    /// The reverse tunnel health monitor exhausted its restart budget.
    #[error("health monitor for reverse tunnel {address} gave up after {restarts} restarts")]
    HealthMonitorGaveUp {
        /// Tunnel address as given.
        address: String,
        /// Restarts attempted.
        restarts: u32,
    },

    /// A file transfer failed.
    #[error("{action} {path}: {reason}")]
    File {
        /// Path involved.
        path: String,
        /// What was being done, e.g. "failed to copy file to remote host".
        action: &'static str,
        /// The underlying cause.
        reason: String,
    },

    /// An SSH channel operation failed.
    #[error("SSH channel error on {host}: {reason}")]
    Channel {
        /// Host the channel belongs to.
        host: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A health endpoint request failed before a response arrived.
    #[error("health request to {url} failed: {source}")]
    Health {
        /// URL requested.
        url: String,
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An I/O error occurred with additional context.
    #[error("{context}: {source}")]
    IoWithContext {
        /// What operation was being performed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },
}

/// Errors raised while connecting, authenticating or keeping the connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to connect to the target host.
    #[error("Failed to connect to master host {host}:{port}: {reason}")]
    Dial {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// The reason for the failure.
        reason: String,
    },

    /// Failed to connect to the bastion host.
    #[error("Could not connect to bastion host {host}:{port}: {reason}")]
    Bastion {
        /// Bastion host.
        host: String,
        /// Bastion port.
        port: u16,
        /// The reason for the failure.
        reason: String,
    },

    /// Bastion reachable, target behind it is not.
    #[error("Failed to connect to target host {host} through bastion host {bastion}: {reason}")]
    ThroughBastion {
        /// Target host.
        host: String,
        /// Bastion host.
        bastion: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Authentication failed.
    #[error("authentication failed for user '{user}' on {host}: {reason}")]
    Authentication {
        /// The user that failed to authenticate.
        user: String,
        /// Host that rejected the credentials.
        host: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Connecting took longer than the configured timeout.
    #[error("connection to {host} timed out after {duration:?}")]
    Timeout {
        /// Host being connected to.
        host: String,
        /// The duration that elapsed.
        duration: Duration,
    },

    /// Nothing to authenticate with.
    #[error(
        "one of SSH keys, SSH_AUTH_SOCK environment variable or become password should be not empty"
    )]
    NoCredentials,

    /// Nothing to authenticate against the bastion with.
    #[error("No credentials present to connect to bastion host")]
    NoBastionCredentials,

    /// `SSH_AUTH_SOCK` is set but the agent cannot be used.
    #[error("Failed to open SSH_AUTH_SOCK: {reason}")]
    AgentUnavailable {
        /// The reason for the failure.
        reason: String,
    },

    /// The session has no host to connect to.
    #[error("no available hosts in session")]
    NoHosts,

    /// An operation was issued before `start`.
    #[error("ssh session not started")]
    NotStarted,

    /// An operation was issued after `stop`.
    #[error("ssh client stopped")]
    Stopped,

    /// Keep-alive detected a dead connection; call `reconnect` first.
    #[error("connection lost: {reason}")]
    Lost {
        /// What the keep-alive probe observed.
        reason: String,
    },
}

/// A remote process finished unsuccessfully.
#[derive(Debug, Clone, Error)]
#[error("{}", format_exit(self))]
pub struct ExitError {
    /// Host the command ran on.
    pub host: String,
    /// The command line that was executed.
    pub command: String,
    /// Exit status, when the server reported one.
    pub status: Option<u32>,
    /// Terminating signal name, when the server reported one.
    pub signal: Option<String>,
    /// Everything the process wrote to stderr.
    pub stderr: String,
}

impl ExitError {
    /// Whether the status means "node is rebooting".
    #[must_use]
    pub fn is_reboot(&self) -> bool {
        self.status == Some(REBOOT_EXIT_STATUS)
    }
}

/// Errors related to local and reverse tunnels.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// `up` was called on a tunnel that is already running.
    #[error("tunnel {address} is already up")]
    AlreadyUp {
        /// Tunnel address as given.
        address: String,
    },

    /// Address could not be parsed.
    #[error("invalid tunnel address '{address}': {reason}")]
    InvalidAddress {
        /// Address as given.
        address: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Binding the local listener failed.
    #[error("failed to listen on {address}: {source}")]
    Bind {
        /// Local address.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Accepting a local connection failed.
    #[error("failed to accept connection on {address}: {reason}")]
    Accept {
        /// Local address.
        address: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A health monitor is already running for this reverse tunnel.
    #[error("health monitor for reverse tunnel {address} is already running")]
    MonitorRunning {
        /// Tunnel address as given.
        address: String,
    },

    /// Opening the remote side of a forwarded connection failed.
    #[error("failed to dial {remote} through tunnel: {reason}")]
    Dial {
        /// Remote endpoint.
        remote: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Splicing the two streams failed.
    #[error("tunnel copy between {local} and {remote} failed: {reason}")]
    Copy {
        /// Local peer.
        local: String,
        /// Remote endpoint.
        remote: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The forward behind a reverse tunnel ended.
    #[error("reverse tunnel invocation {id} exited: {reason}")]
    Exited {
        /// Invocation id of the forward that ended.
        id: u64,
        /// Why it ended.
        reason: String,
    },
}

/// Result type alias for rust-node-ssh operations.
pub type Result<T> = std::result::Result<T, NodeError>;

impl NodeError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error with context.
    pub fn io_context(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoWithContext {
            context: context.into(),
            source,
        }
    }

    /// Create a channel error.
    pub fn channel(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::Channel {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a file transfer error.
    pub fn file(path: impl Into<String>, action: &'static str, reason: impl ToString) -> Self {
        Self::File {
            path: path.into(),
            action,
            reason: reason.to_string(),
        }
    }

    /// Check if this is a timeout of any kind.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Killed { .. }
                | Self::BundleTimeout { .. }
                | Self::Connection(ConnectionError::Timeout { .. })
        )
    }

    /// Check if this is a connection-level error.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Remote exit status, if this error carries one.
    #[must_use]
    pub const fn exit_status(&self) -> Option<u32> {
        match self {
            Self::Exit(exit) => exit.status,
            _ => None,
        }
    }

    /// Whether this is the benign "node is rebooting" exit.
    #[must_use]
    pub fn is_reboot_exit(&self) -> bool {
        matches!(self, Self::Exit(exit) if exit.is_reboot())
    }

    /// Captured stderr, for errors that carry it.
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Exit(exit) => Some(&exit.stderr),
            Self::BecomeRejected { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

impl ConnectionError {
    /// Create a dial error.
    pub fn dial(host: impl Into<String>, port: u16, reason: impl ToString) -> Self {
        Self::Dial {
            host: host.into(),
            port,
            reason: reason.to_string(),
        }
    }

    /// Create an authentication error.
    pub fn authentication(
        user: impl Into<String>,
        host: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Authentication {
            user: user.into(),
            host: host.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(status: Option<u32>, stderr: &str) -> ExitError {
        ExitError {
            host: "10.0.0.1".into(),
            command: "false".into(),
            status,
            signal: None,
            stderr: stderr.into(),
        }
    }

    #[test]
    fn exit_error_display() {
        let err = NodeError::from(exit(Some(1), "boom\n"));
        let msg = err.to_string();
        assert!(msg.contains("process exited with status 1"));
        assert!(msg.contains("10.0.0.1"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn exit_error_signal() {
        let mut e = exit(None, "");
        e.signal = Some("KILL".into());
        assert!(e.to_string().contains("signal KILL"));
    }

    #[test]
    fn reboot_exit() {
        assert!(NodeError::from(exit(Some(255), "")).is_reboot_exit());
        assert!(!NodeError::from(exit(Some(1), "")).is_reboot_exit());
        assert!(!NodeError::config("x").is_reboot_exit());
    }

    #[test]
    fn long_stderr_is_truncated() {
        let stderr = "é".repeat(MAX_STDERR_DISPLAY);
        let msg = format_stderr(&stderr);
        assert!(msg.starts_with("\nstderr (truncated):\n..."));
        assert!(msg.len() < stderr.len() + 32);
    }

    #[test]
    fn become_rejected_mentions_sudoers() {
        let err = NodeError::BecomeRejected {
            host: "node".into(),
            command: "id".into(),
            attempts: 2,
            stderr: "SudoPasswordSorry, try again.\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sudoers"));
        assert!(msg.contains("Sorry, try again"));
        assert_eq!(err.stderr(), Some("SudoPasswordSorry, try again.\n"));
    }

    #[test]
    fn timeout_classification() {
        let killed = NodeError::Killed {
            command: "sleep 10".into(),
            after: Duration::from_secs(1),
        };
        assert!(killed.is_timeout());
        assert!(killed.exit_status().is_none());
        assert!(!NodeError::from(ConnectionError::NoCredentials).is_timeout());
        assert!(NodeError::from(ConnectionError::NoCredentials).is_connection());
    }
}
