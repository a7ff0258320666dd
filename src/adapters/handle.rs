//! Live view of a running command
//!
//! Every adapter returns a [`RunHandle`]: byte streams for stdout/stderr,
//! an exit receiver fed by a background pump task, and a control object
//! that delivers signals the way the target supports them. A handle
//! reaches exactly one terminal state; the exit channel enforces that by
//! construction.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::core::StdinSource;
use crate::error::ExecError;

/// Chunks buffered per stream before the producer backpressures.
pub(crate) const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Read size for stream pumps.
pub(crate) const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Exit code plus the signal that terminated the process, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn clean(code: i32) -> Self {
        Self { code, signal: None }
    }

    pub fn signalled(signal: impl Into<String>, number: i32) -> Self {
        Self {
            code: 128 + number,
            signal: Some(signal.into()),
        }
    }
}

/// Delivers signals to a running process in a target-specific way.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Send a named signal (TERM, INT, ...). Best effort; targets without
    /// per-process signalling map this to their closest equivalent.
    async fn signal(&self, signal: &str) -> Result<(), ExecError>;

    /// Forcibly terminate.
    async fn kill(&self) -> Result<(), ExecError>;
}

/// Live handle for one dispatched run.
pub struct RunHandle {
    pid: Option<u32>,
    stdout: Option<mpsc::Receiver<Bytes>>,
    stderr: Option<mpsc::Receiver<Bytes>>,
    exit: Option<oneshot::Receiver<Result<ExitStatus, ExecError>>>,
    finished: Option<ExitStatus>,
    control: Arc<dyn ProcessControl>,
    /// Adapter-refined target description (e.g. with the auth method)
    target_label: Option<String>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("pid", &self.pid)
            .field("finished", &self.finished)
            .field("target_label", &self.target_label)
            .finish()
    }
}

impl RunHandle {
    pub(crate) fn new(
        pid: Option<u32>,
        stdout: Option<mpsc::Receiver<Bytes>>,
        stderr: Option<mpsc::Receiver<Bytes>>,
        exit: oneshot::Receiver<Result<ExitStatus, ExecError>>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            pid,
            stdout,
            stderr,
            exit: Some(exit),
            finished: None,
            control,
            target_label: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn set_target_label(&mut self, label: String) {
        self.target_label = Some(label);
    }

    /// Target description refined by the adapter, when it knows more than
    /// the static config (SSH records the auth method that won).
    pub fn target_label(&self) -> Option<&str> {
        self.target_label.as_deref()
    }

    /// Take the stdout stream. `None` when the adapter routed stdout away
    /// from the engine (inherit/ignore) or it was already taken.
    pub fn take_stdout(&mut self) -> Option<ReceiverStream<Bytes>> {
        self.stdout.take().map(ReceiverStream::new)
    }

    pub fn take_stderr(&mut self) -> Option<ReceiverStream<Bytes>> {
        self.stderr.take().map(ReceiverStream::new)
    }

    /// Wait for termination. The first call consumes the exit event; later
    /// calls return the cached status.
    pub async fn wait(&mut self) -> Result<ExitStatus, ExecError> {
        if let Some(status) = &self.finished {
            return Ok(status.clone());
        }
        let rx = self.exit.take().ok_or_else(|| ExecError::Protocol {
            target: String::new(),
            message: "run handle already failed".to_string(),
        })?;
        match rx.await {
            Ok(Ok(status)) => {
                self.finished = Some(status.clone());
                Ok(status)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ExecError::Protocol {
                target: String::new(),
                message: "process pump dropped without reporting exit".to_string(),
            }),
        }
    }

    pub async fn signal(&self, signal: &str) -> Result<(), ExecError> {
        self.control.signal(signal).await
    }

    pub async fn kill(&self) -> Result<(), ExecError> {
        self.control.kill().await
    }

    pub(crate) fn control(&self) -> Arc<dyn ProcessControl> {
        self.control.clone()
    }
}

// ============================================================================
// Pump helpers shared by the adapters
// ============================================================================

/// Copy a reader into a chunk channel until EOF or error. The receiver
/// going away is normal (ignored output); read errors end the stream.
pub(crate) fn spawn_reader_pump(
    mut reader: impl AsyncRead + Send + Unpin + 'static,
    tx: mpsc::Sender<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("output pump read error: {}", e);
                    break;
                }
            }
        }
    })
}

/// Feed a child's stdin: optional prelude bytes first (sudo passwords take
/// this path so they never appear in argv), then the user's source, then
/// shutdown to signal EOF.
pub(crate) fn spawn_stdin_feed(
    mut writer: impl AsyncWrite + Send + Unpin + 'static,
    prelude: Option<Bytes>,
    source: StdinSource,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(prelude) = prelude {
            if let Err(e) = writer.write_all(&prelude).await {
                warn!("failed to write stdin prelude: {}", e);
                return;
            }
        }
        match source {
            StdinSource::Null | StdinSource::Inherit => {}
            StdinSource::Bytes(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        warn!("failed to write stdin payload: {}", e);
                    }
                }
            }
            StdinSource::Reader(mut reader) => {
                if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        warn!("failed to stream stdin: {}", e);
                    }
                }
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("stdin shutdown: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopControl;

    #[async_trait]
    impl ProcessControl for NoopControl {
        async fn signal(&self, _signal: &str) -> Result<(), ExecError> {
            Ok(())
        }
        async fn kill(&self) -> Result<(), ExecError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_wait_is_idempotent_after_exit() {
        let (tx, rx) = oneshot::channel();
        let mut handle = RunHandle::new(Some(42), None, None, rx, Arc::new(NoopControl));
        tx.send(Ok(ExitStatus::clean(0))).unwrap();

        assert_eq!(handle.wait().await.unwrap(), ExitStatus::clean(0));
        assert_eq!(handle.wait().await.unwrap(), ExitStatus::clean(0));
        assert_eq!(handle.pid(), Some(42));
    }

    #[tokio::test]
    async fn test_signalled_exit_code_convention() {
        let status = ExitStatus::signalled("TERM", 15);
        assert_eq!(status.code, 143);
        assert_eq!(status.signal.as_deref(), Some("TERM"));
    }

    #[tokio::test]
    async fn test_reader_pump_delivers_chunks_in_order() {
        let (tx, mut rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let data: &[u8] = b"hello world";
        spawn_reader_pump(data, tx).await.unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn test_stdin_feed_writes_prelude_first() {
        let (mut read_half, write_half) = tokio::io::duplex(1024);
        spawn_stdin_feed(
            write_half,
            Some(Bytes::from_static(b"secret\n")),
            StdinSource::Bytes(Bytes::from_static(b"payload")),
        );

        let mut out = Vec::new();
        read_half.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"secret\npayload");
    }
}
