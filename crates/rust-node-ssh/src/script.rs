//! Upload a local script and run it on the remote host.
//!
//! Scripts go to the upload directory from [`ClientConfig`]: the login
//! directory normally, a fixed installer directory under sudo. They are
//! removed after running unless cleanup is disabled.
//!
//! [`ClientConfig`]: crate::config::ClientConfig

mod bundle;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::command::{Command, LineHandler};
use crate::error::{NodeError, Result};
use crate::file::File;
use crate::transport::Transport;

pub use bundle::{BundleTracker, StepEvent, STEP_HEADER};

/// A local script to run remotely.
pub struct Script {
    transport: Arc<dyn Transport>,
    path: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    sudo: bool,
    timeout: Option<Duration>,
    cleanup: bool,
    upload_dir: Option<String>,
    commander_mode: bool,
    stdout_handler: Option<LineHandler>,
    cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("sudo", &self.sudo)
            .field("cleanup", &self.cleanup)
            .field("commander_mode", &self.commander_mode)
            .finish_non_exhaustive()
    }
}

impl Script {
    /// Script at local `path`, run with `args`.
    pub fn new<I, S>(transport: Arc<dyn Transport>, path: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transport,
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            sudo: false,
            timeout: None,
            cleanup: true,
            upload_dir: None,
            commander_mode: false,
            stdout_handler: None,
            cancel: None,
        }
    }

    /// Run under sudo.
    #[must_use]
    pub const fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Environment for the script.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Kill the script after `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether to delete the uploaded script afterwards. Defaults to true.
    #[must_use]
    pub const fn with_cleanup_after_exec(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Upload into `dir` instead of the configured directory.
    #[must_use]
    pub fn with_execute_upload_dir(mut self, dir: impl Into<String>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    /// The script already exists on the remote host at its path: run it
    /// there without uploading or removing it.
    #[must_use]
    pub const fn with_commander_mode(mut self, enabled: bool) -> Self {
        self.commander_mode = enabled;
        self
    }

    /// Observe stdout line by line.
    #[must_use]
    pub fn with_stdout_handler(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stdout_handler = Some(Arc::new(handler));
        self
    }

    /// Stop the script when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn upload_dir(&self) -> String {
        self.upload_dir.clone().unwrap_or_else(|| {
            let config = self.transport.config();
            if self.sudo {
                config.sudo_upload_dir.clone()
            } else {
                config.upload_dir.clone()
            }
        })
    }

    fn script_name(&self) -> Result<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                NodeError::file(
                    self.path.display().to_string(),
                    "failed to open local file",
                    "path has no file name",
                )
            })
    }

    /// Remote path the script is run from.
    pub fn remote_path(&self) -> Result<String> {
        if self.commander_mode {
            return Ok(self.path.display().to_string());
        }
        let dir = self.upload_dir();
        Ok(format!("{}/{}", dir.trim_end_matches('/'), self.script_name()?))
    }

    fn command(&self, program: &str, args: Vec<String>) -> Command {
        let mut cmd = Command::new(Arc::clone(&self.transport), program, args)
            .with_env(self.env.clone());
        if self.sudo {
            cmd = cmd.sudo();
        }
        if let Some(timeout) = self.timeout {
            cmd = cmd.with_timeout(timeout);
        }
        if let Some(token) = &self.cancel {
            cmd = cmd.with_cancellation(token.clone());
        }
        cmd
    }

    /// Upload (unless in commander mode), run and clean up.
    ///
    /// Returns the script's stdout.
    pub async fn execute(&self) -> Result<Vec<u8>> {
        let remote = self.remote_path()?;
        if !self.commander_mode {
            tracing::debug!(local = %self.path.display(), remote = %remote, "Uploading script");
            File::new(Arc::clone(&self.transport))
                .upload(&self.path, &remote)
                .await?;
        }

        let mut args = vec![remote.clone()];
        args.extend(self.args.iter().cloned());
        let mut cmd = self.command("bash", args);
        if let Some(handler) = &self.stdout_handler {
            let handler = Arc::clone(handler);
            cmd = cmd.with_stdout_handler(move |line| handler(line));
        }

        let result = cmd.run().await;
        if self.cleanup && !self.commander_mode {
            self.remove(&remote).await;
        }
        result.map(|()| cmd.stdout_bytes().to_vec())
    }

    async fn remove(&self, remote: &str) {
        let mut rm = Command::new(Arc::clone(&self.transport), "rm", ["-f", remote]);
        if self.sudo {
            rm = rm.sudo();
        }
        if let Err(e) = rm.run().await {
            tracing::warn!(path = remote, error = %e, "Failed to remove uploaded script");
        }
    }

    /// Pack `parent_dir/bundle_dir`, upload it and run its entrypoint under
    /// sudo, tracking `=== Step:` headers.
    ///
    /// Fails with [`NodeError::BundleTimeout`] once one step has failed more
    /// than the configured number of times in a row.
    pub async fn execute_bundle(&self, parent_dir: &Path, bundle_dir: &str) -> Result<()> {
        bundle::execute(self, parent_dir, bundle_dir).await
    }
}
