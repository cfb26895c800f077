//! Per-stream output sinks.
//!
//! Each sink task owns the capture buffer of one stream. It splits the bytes
//! into lines for the caller's handler and the debug echo.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::matcher::OutputStream;

/// Called with every complete output line, without the line terminator.
pub type LineHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Splits a byte stream into lines, keeping the unterminated tail.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    /// Feed bytes, calling `on_line` for each finished line.
    pub(crate) fn push(&mut self, bytes: &[u8], mut on_line: impl FnMut(&str)) {
        for &b in bytes {
            if b == b'\n' {
                emit(&self.partial, &mut on_line);
                self.partial.clear();
            } else {
                self.partial.push(b);
            }
        }
    }

    /// Emit what is left as a final line.
    pub(crate) fn finish(&mut self, mut on_line: impl FnMut(&str)) {
        if !self.partial.is_empty() {
            emit(&self.partial, &mut on_line);
            self.partial.clear();
        }
    }
}

fn emit(line: &[u8], on_line: &mut impl FnMut(&str)) {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    on_line(&String::from_utf8_lossy(line));
}

/// Spawn the sink for one stream. The task ends when `chunks` closes and
/// returns the captured bytes.
pub(crate) fn spawn_sink(
    stream: OutputStream,
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
    handler: Option<LineHandler>,
    host: String,
) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut lines = LineSplitter::default();
        let mut on_line = |line: &str| {
            tracing::debug!(host = %host, stream = stream.as_str(), "{line}");
            if let Some(handler) = &handler {
                handler(line);
            }
        };
        while let Some(chunk) = chunks.recv().await {
            captured.extend_from_slice(&chunk);
            lines.push(&chunk, &mut on_line);
        }
        lines.finish(&mut on_line);
        captured
    })
}
