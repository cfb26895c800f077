//! Remote command execution.
//!
//! A [`Command`] runs one program on the remote host. Output is captured per
//! stream and in arrival order, can be observed line by line through
//! handlers, and is echoed at `debug` level.
//!
//! # Privilege escalation
//!
//! With [`Command::sudo`] the command line is wrapped as
//!
//! ```text
//! sudo -p SudoPassword -H -S -i bash -c 'echo SUDO-SUCCESS && <command>'
//! ```
//!
//! The prompt is answered with the session's become password. Output is held
//! back until `SUDO-SUCCESS` appears, so neither the prompt nor the marker
//! reach the capture buffers. A second prompt means the password was
//! rejected; the command then fails with [`NodeError::BecomeRejected`].
//!
//! # Example
//!
//! ```ignore
//! let mut cmd = Command::new(client.clone(), "systemctl", ["is-active", "kubelet"]).sudo();
//! let (stdout, _stderr) = cmd.output().await?;
//! ```

mod output;
mod stop;
mod supervisor;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, Result};
use crate::matcher::{SUDO_PROMPT, SUDO_SUCCESS};
use crate::transport::Transport;

pub use output::LineHandler;
pub use stop::StopHandle;

use stop::StopControl;
use supervisor::{Outcome, Supervision};

/// Called once the remote command is actually running (after sudo accepted
/// the password, when escalating).
pub type StartHandler = Box<dyn FnOnce() + Send>;

/// Called with the final result of a command.
pub type WaitHandler = Box<dyn FnOnce(&Result<()>) + Send>;

struct Running {
    stop: StopHandle,
    task: JoinHandle<Outcome>,
}

/// One remote command invocation. Create a new one per run.
pub struct Command {
    transport: Arc<dyn Transport>,
    name: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    sudo: bool,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    stdout_handler: Option<LineHandler>,
    stderr_handler: Option<LineHandler>,
    on_start: Option<StartHandler>,
    on_wait: Option<WaitHandler>,
    running: Option<Running>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("command", &self.display_line())
            .field("sudo", &self.sudo)
            .field("timeout", &self.timeout)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl Command {
    /// Command `name` with `args` on `transport`.
    pub fn new<I, S>(transport: Arc<dyn Transport>, name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transport,
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            sudo: false,
            timeout: None,
            cancel: None,
            stdout_handler: None,
            stderr_handler: None,
            on_start: None,
            on_wait: None,
            running: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            combined: Vec::new(),
        }
    }

    /// Run under sudo with the session's become password.
    #[must_use]
    pub const fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Export environment variables before running.
    #[must_use]
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Stop the command after `timeout`; it then fails with
    /// [`NodeError::Killed`].
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stop the command when `token` is cancelled; it then fails with
    /// [`NodeError::Cancelled`].
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Observe stdout line by line.
    #[must_use]
    pub fn with_stdout_handler(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stdout_handler = Some(Arc::new(handler));
        self
    }

    /// Observe stderr line by line.
    #[must_use]
    pub fn with_stderr_handler(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    /// Called once the command is running.
    #[must_use]
    pub fn on_command_start(mut self, handler: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(handler));
        self
    }

    /// Called with the final result, also when nobody calls [`wait`](Self::wait).
    #[must_use]
    pub fn with_wait_handler(mut self, handler: impl FnOnce(&Result<()>) + Send + 'static) -> Self {
        self.on_wait = Some(Box::new(handler));
        self
    }

    /// Program name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The command as the remote shell sees it, before sudo wrapping.
    #[must_use]
    pub fn display_line(&self) -> String {
        let mut line = String::new();
        for (key, value) in &self.env {
            line.push_str(&format!(
                "export {key}={}; ",
                shell_escape::unix::escape(value.as_str().into())
            ));
        }
        line.push_str(&self.name);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote_arg(arg));
        }
        line
    }

    /// The full remote command line.
    #[must_use]
    pub fn command_line(&self) -> String {
        let line = self.display_line();
        if !self.sudo {
            return line;
        }
        let inner = format!("echo {SUDO_SUCCESS} && {line}");
        format!(
            "sudo -p {SUDO_PROMPT} -H -S -i bash -c {}",
            shell_escape::unix::escape(inner.into())
        )
    }

    /// Start the command without waiting for it.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(NodeError::channel(
                self.transport.host(),
                format!("command `{}` already started", self.display_line()),
            ));
        }
        let host = self.transport.host();
        let command = self.display_line();
        tracing::debug!(host = %host, command = %command, sudo = self.sudo, "Starting command");

        let process = self.transport.exec(self.command_line()).await?;
        let stop = StopControl::new(process.control.clone(), self.transport.config().stop_grace);

        let ctx = Supervision {
            host,
            command,
            sudo: self.sudo,
            become_pass: self.transport.become_pass(),
            timeout: self.timeout,
            cancel: self.cancel.clone(),
            stdout_handler: self.stdout_handler.clone(),
            stderr_handler: self.stderr_handler.clone(),
            on_start: self.on_start.take(),
            on_wait: self.on_wait.take(),
        };
        let task = tokio::spawn(supervisor::supervise(process, Arc::clone(&stop), ctx));
        self.running = Some(Running {
            stop: StopHandle { inner: stop },
            task,
        });
        Ok(())
    }

    /// Wait for a started command and collect its output.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Err(NodeError::channel(
                self.transport.host(),
                format!("command `{}` was not started", self.display_line()),
            ));
        };
        let outcome = running
            .task
            .await
            .map_err(|e| NodeError::channel(self.transport.host(), format!("command task failed: {e}")))?;
        self.stdout = outcome.stdout;
        self.stderr = outcome.stderr;
        self.combined = outcome.combined;
        outcome.result
    }

    /// Start and wait.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    /// Run and return stdout and stderr.
    ///
    /// On failure the output stays readable through
    /// [`stdout_bytes`](Self::stdout_bytes) and [`stderr_bytes`](Self::stderr_bytes).
    pub async fn output(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.run().await?;
        Ok((self.stdout.clone(), self.stderr.clone()))
    }

    /// Run and return stdout and stderr interleaved in arrival order.
    pub async fn combined_output(&mut self) -> Result<Vec<u8>> {
        self.run().await?;
        Ok(self.combined.clone())
    }

    /// Handle for stopping the started command from elsewhere.
    #[must_use]
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.running.as_ref().map(|r| r.stop.clone())
    }

    /// Interrupt the started command, killing it after the grace period.
    /// Does nothing if the command is not running.
    pub async fn stop(&self) {
        if let Some(running) = &self.running {
            running.stop.stop().await;
        }
    }

    /// Captured stdout of the last run.
    #[must_use]
    pub fn stdout_bytes(&self) -> &[u8] {
        &self.stdout
    }

    /// Captured stderr of the last run.
    #[must_use]
    pub fn stderr_bytes(&self) -> &[u8] {
        &self.stderr
    }

    /// Captured stdout and stderr of the last run, in arrival order.
    #[must_use]
    pub fn combined_bytes(&self) -> &[u8] {
        &self.combined
    }
}

/// Double-quote arguments containing spaces unless already quoted.
fn quote_arg(arg: &str) -> String {
    let quoted = arg.len() >= 2
        && ((arg.starts_with('"') && arg.ends_with('"'))
            || (arg.starts_with('\'') && arg.ends_with('\'')));
    if arg.contains(' ') && !quoted {
        format!("\"{arg}\"")
    } else {
        arg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg("two words"), "\"two words\"");
        assert_eq!(quote_arg("\"already quoted\""), "\"already quoted\"");
        assert_eq!(quote_arg("'single quoted'"), "'single quoted'");
    }
}
