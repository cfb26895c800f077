//! Bundle execution and step tracking.
//!
//! A bundle is a directory with an entrypoint that runs numbered steps and
//! retries a failing step until it passes. Each attempt prints a header
//! line; seeing the same step twice in a row means the previous attempt
//! failed.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use super::Script;
use crate::command::Command;
use crate::error::{NodeError, Result};
use crate::file::File;

/// Prefix of a step header line.
pub const STEP_HEADER: &str = "=== Step: ";

/// What a line of bundle output meant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    /// Ordinary output, buffered for the current step.
    Output,
    /// A new step started.
    Started {
        /// Step path from the header.
        step: String,
    },
    /// The current step started again after failing.
    Retried {
        /// Step path from the header.
        step: String,
        /// Consecutive failures so far.
        failures: u32,
        /// Output of the failed attempt.
        log: String,
    },
    /// The step failed more often than allowed.
    GaveUp {
        /// Step path from the header.
        step: String,
        /// Consecutive failures seen.
        failures: u32,
        /// Output of the last failed attempt.
        log: String,
    },
}

/// Follows step headers in bundle output.
#[derive(Debug, Clone)]
pub struct BundleTracker {
    max_failures: u32,
    step: Option<String>,
    failures: u32,
    log: Vec<String>,
}

impl BundleTracker {
    /// Give up once a step fails more than `max_failures` times in a row.
    #[must_use]
    pub const fn new(max_failures: u32) -> Self {
        Self {
            max_failures,
            step: None,
            failures: 0,
            log: Vec::new(),
        }
    }

    /// Current step, if a header was seen.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        self.step.as_deref()
    }

    /// Consecutive failures of the current step.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Classify one output line.
    pub fn push_line(&mut self, line: &str) -> StepEvent {
        let Some(step) = line.strip_prefix(STEP_HEADER).map(str::trim) else {
            self.log.push(line.to_string());
            return StepEvent::Output;
        };

        let log = std::mem::take(&mut self.log).join("\n");
        if self.step.as_deref() != Some(step) {
            self.step = Some(step.to_string());
            self.failures = 0;
            return StepEvent::Started {
                step: step.to_string(),
            };
        }

        self.failures += 1;
        if self.failures > self.max_failures {
            return StepEvent::GaveUp {
                step: step.to_string(),
                failures: self.failures,
                log,
            };
        }
        StepEvent::Retried {
            step: step.to_string(),
            failures: self.failures,
            log,
        }
    }
}

/// Create `<archive>` from `parent_dir/bundle_dir`, entries rooted at
/// `bundle_dir`.
fn pack(parent_dir: &Path, bundle_dir: &str, archive: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(archive)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder.append_dir_all(bundle_dir, parent_dir.join(bundle_dir))?;
    builder.into_inner()?.sync_all()
}

pub(super) async fn execute(script: &Script, parent_dir: &Path, bundle_dir: &str) -> Result<()> {
    let config = script.transport.config().clone();
    let archive_name = format!("{bundle_dir}.tar");
    let remote_dir = script
        .upload_dir
        .clone()
        .unwrap_or_else(|| config.sudo_upload_dir.clone());
    let remote_dir = remote_dir.trim_end_matches('/').to_string();
    let remote_archive = format!("{remote_dir}/{archive_name}");

    let staging = tempfile::tempdir()
        .map_err(|e| NodeError::io_context("failed to create bundle staging directory", e))?;
    let local_archive = staging.path().join(&archive_name);
    let bundle_path = parent_dir.join(bundle_dir);
    {
        let parent_dir = parent_dir.to_path_buf();
        let bundle_dir = bundle_dir.to_string();
        let local_archive = local_archive.clone();
        tokio::task::spawn_blocking(move || pack(&parent_dir, &bundle_dir, &local_archive))
            .await
            .map_err(|e| NodeError::config(format!("bundle packing task failed: {e}")))?
            .map_err(|e| {
                NodeError::io_context(
                    format!("failed to pack bundle {}", bundle_path.display()),
                    e,
                )
            })?;
    }

    tracing::info!(bundle = bundle_dir, remote = %remote_archive, "Uploading bundle");
    let mut mkdir = Command::new(Arc::clone(&script.transport), "mkdir", ["-p", remote_dir.as_str()]).sudo();
    mkdir.run().await?;
    File::new(Arc::clone(&script.transport))
        .upload(&local_archive, &remote_archive)
        .await?;

    let line = format!(
        "tar xpof {remote_archive} -C {remote_dir} && cd {remote_dir}/{bundle_dir} && ./{}",
        config.bundle.entrypoint
    );

    let tracker = Arc::new(Mutex::new(BundleTracker::new(config.bundle.max_step_failures)));
    let gave_up: Arc<Mutex<Option<(String, u32)>>> = Arc::default();
    let abort = script
        .cancel
        .as_ref()
        .map_or_else(CancellationToken::new, CancellationToken::child_token);

    let handler = {
        let tracker = Arc::clone(&tracker);
        let gave_up = Arc::clone(&gave_up);
        let abort = abort.clone();
        let user_handler = script.stdout_handler.clone();
        move |line: &str| {
            if let Some(user_handler) = &user_handler {
                user_handler(line);
            }
            if line == "===" {
                return;
            }
            let event = tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_line(line);
            match event {
                StepEvent::Output => {}
                StepEvent::Started { step } => tracing::info!(step = %step, "Run step"),
                StepEvent::Retried { step, failures, log } => {
                    tracing::error!("{log}");
                    tracing::info!(step = %step, failures, "Run step finished with error, retrying");
                }
                StepEvent::GaveUp { step, failures, log } => {
                    tracing::error!("{log}");
                    tracing::error!(step = %step, failures, "Bundle step keeps failing, giving up");
                    *gave_up.lock().unwrap_or_else(PoisonError::into_inner) = Some((step, failures));
                    abort.cancel();
                }
            }
        }
    };

    let mut cmd = Command::new(Arc::clone(&script.transport), "bash", ["-c", line.as_str()])
        .sudo()
        .with_env(script.env.clone())
        .with_cancellation(abort)
        .with_stdout_handler(handler);
    if let Some(timeout) = script.timeout {
        cmd = cmd.with_timeout(timeout);
    }

    let result = cmd.run().await;
    if let Some((step, failures)) = gave_up.lock().unwrap_or_else(PoisonError::into_inner).take() {
        return Err(NodeError::BundleTimeout { step, failures });
    }
    result
}
