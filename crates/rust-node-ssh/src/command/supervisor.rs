//! The task that drives one started command to completion.
//!
//! It is the only reader of the process events. It runs the sudo handshake,
//! owns the combined output buffer and feeds the per-stream sinks. Timeout
//! and cancellation watchers run beside it and go through [`StopControl`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::output::{self, LineHandler};
use super::stop::{StopControl, StopReason};
use super::{StartHandler, WaitHandler};
use crate::error::{ExitError, NodeError, Result};
use crate::matcher::{BecomeHandshake, HandshakeEvent, OutputStream};
use crate::transport::{ProcessControl, ProcessEvent, ProcessHandle};

/// Everything a finished command leaves behind.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub(crate) result: Result<()>,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) combined: Vec<u8>,
}

/// Inputs of [`supervise`], fixed at start.
pub(crate) struct Supervision {
    pub(crate) host: String,
    pub(crate) command: String,
    pub(crate) sudo: bool,
    pub(crate) become_pass: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) stdout_handler: Option<LineHandler>,
    pub(crate) stderr_handler: Option<LineHandler>,
    pub(crate) on_start: Option<StartHandler>,
    pub(crate) on_wait: Option<WaitHandler>,
}

struct Scanner {
    host: String,
    handshake: Option<BecomeHandshake>,
    become_pass: Option<String>,
    control: mpsc::UnboundedSender<ProcessControl>,
    on_start: Option<StartHandler>,
    held: Vec<(OutputStream, Bytes)>,
    /// Stream whose next chunk may still start with the marker's newline.
    strip_newline: Option<OutputStream>,
    combined: Vec<u8>,
    stdout: mpsc::UnboundedSender<Bytes>,
    stderr: mpsc::UnboundedSender<Bytes>,
}

impl Scanner {
    fn emit(&mut self, stream: OutputStream, chunk: Bytes) {
        self.combined.extend_from_slice(&chunk);
        let sink = match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        };
        let _ = sink.send(chunk);
    }

    fn started(&mut self) {
        if let Some(on_start) = self.on_start.take() {
            on_start();
        }
    }

    fn answer_prompt(&self, attempt: u32) {
        if attempt > 1 {
            tracing::error!(host = %self.host, attempt, "Bad sudo password");
        }
        match &self.become_pass {
            Some(pass) => {
                let _ = self
                    .control
                    .send(ProcessControl::Stdin(Bytes::from(format!("{pass}\n"))));
            }
            None => {
                tracing::error!(host = %self.host, "sudo asked for a password but none is set");
                let _ = self.control.send(ProcessControl::CloseStdin);
            }
        }
    }

    /// Route one chunk. Until sudo confirms, output is held back so the
    /// prompt and the marker never reach the capture buffers.
    fn route(&mut self, stream: OutputStream, chunk: Bytes) {
        let Some(handshake) = self.handshake.as_mut().filter(|h| !h.is_confirmed()) else {
            let chunk = self.strip_marker_newline(stream, chunk);
            if !chunk.is_empty() {
                self.emit(stream, chunk);
            }
            return;
        };

        for event in handshake.feed(stream, &chunk) {
            match event {
                HandshakeEvent::Prompt { attempt } => self.answer_prompt(attempt),
                HandshakeEvent::Confirmed { offset } => {
                    tracing::debug!(host = %self.host, "sudo accepted");
                    self.held.clear();
                    self.strip_newline = Some(stream);
                    let rest = self.strip_marker_newline(stream, chunk.slice(offset..));
                    self.started();
                    if !rest.is_empty() {
                        self.emit(stream, rest);
                    }
                    return;
                }
            }
        }
        self.held.push((stream, chunk));
    }

    /// Drop the newline ending the marker line, which may arrive in a later
    /// chunk than the marker itself.
    fn strip_marker_newline(&mut self, stream: OutputStream, chunk: Bytes) -> Bytes {
        if self.strip_newline != Some(stream) || chunk.is_empty() {
            return chunk;
        }
        self.strip_newline = None;
        if chunk.first() == Some(&b'\n') {
            chunk.slice(1..)
        } else {
            chunk
        }
    }

    /// Release output held for a handshake that never completed.
    fn flush_held(&mut self) {
        for (stream, chunk) in std::mem::take(&mut self.held) {
            self.emit(stream, chunk);
        }
    }

    fn rejected_attempts(&self) -> Option<u32> {
        let handshake = self.handshake.as_ref()?;
        let attempts = handshake.attempts();
        let wrong = attempts >= 2 || (attempts >= 1 && self.become_pass.is_none());
        (!handshake.is_confirmed() && wrong).then_some(attempts)
    }
}

/// Run `process` to completion.
pub(crate) async fn supervise(
    process: ProcessHandle,
    stop: Arc<StopControl>,
    mut ctx: Supervision,
) -> Outcome {
    let ProcessHandle {
        mut events,
        control,
    } = process;

    let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
    let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
    let stdout_sink = output::spawn_sink(
        OutputStream::Stdout,
        stdout_rx,
        ctx.stdout_handler.take(),
        ctx.host.clone(),
    );
    let stderr_sink = output::spawn_sink(
        OutputStream::Stderr,
        stderr_rx,
        ctx.stderr_handler.take(),
        ctx.host.clone(),
    );

    let mut watchers = Vec::new();
    if let Some(timeout) = ctx.timeout {
        let stop = Arc::clone(&stop);
        watchers.push(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            stop.stop(StopReason::Timeout).await;
        }));
    }
    if let Some(cancel) = ctx.cancel.clone() {
        let stop = Arc::clone(&stop);
        watchers.push(tokio::spawn(async move {
            cancel.cancelled().await;
            stop.stop(StopReason::Cancelled).await;
        }));
    }

    let mut scanner = Scanner {
        host: ctx.host.clone(),
        handshake: ctx.sudo.then(BecomeHandshake::new),
        become_pass: ctx.become_pass.take(),
        control,
        on_start: ctx.on_start.take(),
        held: Vec::new(),
        strip_newline: None,
        combined: Vec::new(),
        stdout: stdout_tx,
        stderr: stderr_tx,
    };
    if scanner.handshake.is_none() {
        scanner.started();
    }

    let mut status = None;
    let mut signal = None;
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Stdout(chunk) => scanner.route(OutputStream::Stdout, chunk),
            ProcessEvent::Stderr(chunk) => scanner.route(OutputStream::Stderr, chunk),
            ProcessEvent::Exit(code) => status = Some(code),
            ProcessEvent::Signal(name) => signal = Some(name),
        }
    }

    let stopped_by = stop.finish();
    for watcher in watchers {
        watcher.abort();
    }

    let rejected = scanner.rejected_attempts();
    scanner.flush_held();
    let Scanner {
        combined,
        stdout: stdout_tx,
        stderr: stderr_tx,
        ..
    } = scanner;
    drop((stdout_tx, stderr_tx));
    let stdout = stdout_sink.await.unwrap_or_default();
    let stderr = stderr_sink.await.unwrap_or_default();

    let result = match (stopped_by, rejected) {
        (Some(StopReason::Timeout), _) => Err(NodeError::Killed {
            command: ctx.command.clone(),
            after: ctx.timeout.unwrap_or_default(),
        }),
        (Some(StopReason::Cancelled), _) => Err(NodeError::Cancelled {
            command: ctx.command.clone(),
        }),
        (Some(StopReason::Manual), _) => Ok(()),
        (None, Some(attempts)) => Err(NodeError::BecomeRejected {
            host: ctx.host.clone(),
            command: ctx.command.clone(),
            attempts,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }),
        (None, None) => exit_result(&ctx, status, signal, &stderr),
    };

    if let Err(e) = &result {
        tracing::debug!(host = %ctx.host, command = %ctx.command, error = %e, "Command failed");
    }
    if let Some(on_wait) = ctx.on_wait.take() {
        on_wait(&result);
    }

    Outcome {
        result,
        stdout,
        stderr,
        combined,
    }
}

fn exit_result(
    ctx: &Supervision,
    status: Option<u32>,
    signal: Option<String>,
    stderr: &[u8],
) -> Result<()> {
    match (status, signal) {
        (Some(0), _) => Ok(()),
        (None, None) => Err(NodeError::channel(
            &ctx.host,
            format!("command `{}` ended without exit status", ctx.command),
        )),
        (status, signal) => Err(ExitError {
            host: ctx.host.clone(),
            command: ctx.command.clone(),
            status,
            signal,
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
        .into()),
    }
}
