//! Output relay -- channel-backed byte pipe drained line-by-line.
//!
//! The write half implements `std::io::Write` so the engine can treat it as
//! an ordinary output stream from the blocking worker; dropping it closes
//! the channel, which is the relay's end-of-stream signal. The drain task
//! forwards one observer call per logical line, preserving arrival order.

use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::observer::TestObserver;

/// Lines longer than this are flushed at the boundary instead of buffering
/// without bound. Nothing is dropped.
pub(crate) const MAX_LINE_BYTES: usize = 8 * 1024;

pub(crate) fn byte_pipe() -> (PipeWriter, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PipeWriter { tx }, rx)
}

/// Write half of the pipe, handed to the engine as its output target.
pub(crate) struct PipeWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PipeWriter {
    /// Second handle onto the pipe for the bridge's own status lines, so
    /// they share the engine output's delivery order. The relay only sees
    /// end-of-stream once every handle is gone.
    pub(crate) fn line_sender(&self) -> LineSender {
        LineSender {
            tx: self.tx.clone(),
        }
    }
}

/// Line-oriented handle onto the pipe. Sends are best-effort: a line sent
/// after the relay has shut down is dropped.
#[derive(Clone)]
pub(crate) struct LineSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl LineSender {
    pub(crate) fn send_line(&self, line: &str) {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        let _ = self.tx.send(bytes);
    }
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "output relay closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Drain the pipe until end-of-stream, forwarding each line to the
/// observer. Returns only after the final unterminated tail (if any) has
/// been delivered; the observer is never called after that.
pub(crate) async fn drain(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    observer: Arc<dyn TestObserver>,
) {
    let mut pending: Vec<u8> = Vec::new();
    while let Some(chunk) = rx.recv().await {
        pending.extend_from_slice(&chunk);
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            forward(observer.as_ref(), &line).await;
        }
        if pending.len() > MAX_LINE_BYTES {
            let line: Vec<u8> = pending.drain(..).collect();
            forward(observer.as_ref(), &line).await;
        }
    }
    if !pending.is_empty() {
        forward(observer.as_ref(), &pending).await;
    }
}

async fn forward(observer: &dyn TestObserver, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    observer.on_output(text.trim_end_matches(['\r', '\n'])).await;
}
