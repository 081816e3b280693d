//! Line-extraction over a child's stdout/stderr.
//!
//! Each stream gets its own background task and its own channel; the shell
//! awaits both concurrently with `tokio::select!`. Interleaving *across* the
//! two streams is unspecified (per spec), but each stream's own arrival
//! order is preserved because a single task reads it sequentially.

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::charset::Charset;

const READ_BUF_SIZE: usize = 4096;

/// One event out of a pumped stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEvent {
    /// A complete line, with trailing `\r?\n` stripped.
    Line(String),
    /// The stream hit EOF or a read error; no more events will follow.
    Closed,
}

/// Owns the two background line-reading tasks for one shell's child.
pub struct LinePump {
    stdout_rx: mpsc::UnboundedReceiver<PumpEvent>,
    stderr_rx: mpsc::UnboundedReceiver<PumpEvent>,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl LinePump {
    /// Spawn the stdout/stderr pump tasks for a freshly-spawned child.
    pub fn spawn<O, E>(stdout: O, stderr: E, charset: Charset) -> Self
    where
        O: tokio::io::AsyncRead + Unpin + Send + 'static,
        E: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(pump_stream(stdout, charset, stdout_tx));

        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let stderr_task = tokio::spawn(pump_stream(stderr, charset, stderr_tx));

        Self {
            stdout_rx,
            stderr_rx,
            stdout_task,
            stderr_task,
        }
    }

    /// Await the next stdout event. Returns `None` only if the task panicked.
    pub async fn recv_stdout(&mut self) -> Option<PumpEvent> {
        self.stdout_rx.recv().await
    }

    /// Await the next stderr event. Returns `None` only if the task panicked.
    pub async fn recv_stderr(&mut self) -> Option<PumpEvent> {
        self.stderr_rx.recv().await
    }

    /// Drain and discard any events already buffered on either channel,
    /// without blocking. Used when a cancelled submission must not let
    /// leftover lines bleed into the next one.
    pub fn drain_pending(&mut self) {
        while self.stdout_rx.try_recv().is_ok() {}
        while self.stderr_rx.try_recv().is_ok() {}
    }
}

impl Drop for LinePump {
    fn drop(&mut self) {
        self.stdout_task.abort();
        self.stderr_task.abort();
    }
}

async fn pump_stream<R>(mut reader: R, charset: Charset, tx: mpsc::UnboundedSender<PumpEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut residual: Vec<u8> = Vec::new();
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                flush_residual(&mut residual, charset, &tx);
                let _ = tx.send(PumpEvent::Closed);
                return;
            }
            Ok(n) => {
                residual.extend_from_slice(&buf[..n]);
                while let Some(pos) = residual.iter().position(|&b| b == b'\n') {
                    let mut line_bytes: Vec<u8> = residual.drain(..=pos).collect();
                    line_bytes.pop(); // trailing \n
                    if line_bytes.last() == Some(&b'\r') {
                        line_bytes.pop();
                    }
                    if tx.send(PumpEvent::Line(charset.decode(&line_bytes))).is_err() {
                        return;
                    }
                }
            }
            Err(error) => {
                tracing::debug!(%error, "pump stream read error");
                flush_residual(&mut residual, charset, &tx);
                let _ = tx.send(PumpEvent::Closed);
                return;
            }
        }
    }
}

fn flush_residual(residual: &mut Vec<u8>, charset: Charset, tx: &mpsc::UnboundedSender<PumpEvent>) {
    if !residual.is_empty() {
        let _ = tx.send(PumpEvent::Line(charset.decode(residual)));
        residual.clear();
    }
}
