//! Run supervision
//!
//! Target-agnostic half of every run: consume the handle's streams with
//! routing and `max_buffer` enforcement, publish bus events, enforce
//! timeout and cancellation with signal → grace → KILL escalation, and
//! finalize into a result or a taxonomy error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::EngineInner;
use crate::adapters::{Adapter, ExitStatus, ProcessControl};
use crate::core::{ExecResult, OutputRouting, RunSpec, Target};
use crate::error::ExecError;
use crate::events::RunEvent;

/// Cap on stderr carried inside a `Command` error.
const ERROR_STDERR_CAP: usize = 8 * 1024;

/// Cap on partial output carried inside timeout/cancel diagnostics.
const DIAGNOSTIC_TAIL_CAP: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    TimedOut,
    Cancelled,
}

/// Run one frozen spec against its target. The engine-facing commit point:
/// past the adapter's `execute`, the spec is owned here until terminal.
pub(crate) async fn dispatch(
    inner: &EngineInner,
    target: &Target,
    mut spec: RunSpec,
) -> Result<ExecResult, ExecError> {
    spec.validate()?;

    let run_id = Uuid::new_v4();
    let command_text = spec.render_command();
    let target_text = target.describe();

    // Cancellation before dispatch never borrows a connection.
    if spec.cancel.is_cancelled() {
        return Err(ExecError::Cancelled {
            target: target_text,
            command: command_text,
            duration: Duration::ZERO,
        });
    }

    inner.events.publish(RunEvent::Started {
        id: run_id,
        target: target_text.clone(),
        command: command_text.clone(),
    });

    let adapter = inner.adapter_for(target);
    let outcome = supervise(
        inner,
        adapter,
        target,
        &mut spec,
        run_id,
        &target_text,
        &command_text,
    )
    .await;

    match &outcome {
        Ok(result) => {
            inner.events.publish(RunEvent::Completed {
                id: run_id,
                result: result.clone(),
            });
        }
        Err(e) => {
            inner.events.publish(RunEvent::Failed {
                id: run_id,
                kind: e.kind(),
                message: e.to_string(),
            });
        }
    }
    outcome
}

struct CaptureBuf {
    data: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl CaptureBuf {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            overflowed: false,
        }
    }

    /// Append respecting the cap. Exactly `limit` bytes is fine; one more
    /// trips the overflow flag.
    fn push(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.data.len() + chunk.len() > self.limit {
            let room = self.limit - self.data.len();
            self.data.extend_from_slice(&chunk[..room]);
            self.overflowed = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    fn tail_text(&self) -> String {
        let start = self.data.len().saturating_sub(DIAGNOSTIC_TAIL_CAP);
        String::from_utf8_lossy(&self.data[start..]).into_owned()
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    inner: &EngineInner,
    adapter: &dyn Adapter,
    target: &Target,
    spec: &mut RunSpec,
    run_id: Uuid,
    target_text: &str,
    command_text: &str,
) -> Result<ExecResult, ExecError> {
    let started_at = Utc::now();
    let start = Instant::now();

    let mut handle = adapter
        .execute(target, spec)
        .await
        .map_err(|e| e.with_context(target_text, command_text))?;

    let target_label = handle
        .target_label()
        .map(str::to_string)
        .unwrap_or_else(|| target_text.to_string());
    let control = handle.control();
    let mut stdout_stream = handle.take_stdout();
    let mut stderr_stream = handle.take_stderr();

    let mut stdout_buf = CaptureBuf::new(spec.max_buffer);
    let mut stderr_buf = CaptureBuf::new(spec.max_buffer);

    let cancel = spec.cancel.clone();
    let effective_timeout = spec.effective_timeout();

    let wait_fut = handle.wait();
    tokio::pin!(wait_fut);

    let timeout_fut = async {
        match effective_timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timeout_fut);

    let mut exit: Option<Result<ExitStatus, ExecError>> = None;
    let mut interrupt: Option<Interrupt> = None;
    let mut kill_requested = false;
    // Once escalation starts, the run is abandoned if the process ignores
    // even SIGKILL for a grace period beyond the escalation window.
    let mut abandon_at: Option<tokio::time::Instant> = None;

    loop {
        let abandon_fut = async {
            match abandon_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            chunk = next_chunk(&mut stdout_stream), if stdout_stream.is_some() => {
                match chunk {
                    Some(chunk) => {
                        inner.events.publish(RunEvent::Stdout { id: run_id, chunk: chunk.clone() });
                        route_chunk(&chunk, &spec.stdout, &mut stdout_buf, false).await;
                    }
                    None => stdout_stream = None,
                }
            }
            chunk = next_chunk(&mut stderr_stream), if stderr_stream.is_some() => {
                match chunk {
                    Some(chunk) => {
                        inner.events.publish(RunEvent::Stderr { id: run_id, chunk: chunk.clone() });
                        route_chunk(&chunk, &spec.stderr, &mut stderr_buf, true).await;
                    }
                    None => stderr_stream = None,
                }
            }
            status = &mut wait_fut, if exit.is_none() => {
                exit = Some(status);
            }
            _ = &mut timeout_fut, if interrupt.is_none() && exit.is_none() => {
                interrupt = Some(Interrupt::TimedOut);
                escalate(control.clone(), spec.kill_signal.clone(), spec.grace_period);
                abandon_at = Some(tokio::time::Instant::now() + spec.grace_period * 2);
            }
            _ = cancel.cancelled(), if interrupt.is_none() && exit.is_none() => {
                // Cancellation after exit is a no-op by the guard above.
                interrupt = Some(Interrupt::Cancelled);
                escalate(control.clone(), spec.kill_signal.clone(), spec.grace_period);
                abandon_at = Some(tokio::time::Instant::now() + spec.grace_period * 2);
            }
            _ = abandon_fut, if abandon_at.is_some() => {
                warn!(command = %command_text, "process ignored kill escalation; abandoning");
                break;
            }
            else => break,
        }

        if (stdout_buf.overflowed || stderr_buf.overflowed) && !kill_requested {
            kill_requested = true;
            let control = control.clone();
            tokio::spawn(async move {
                let _ = control.kill().await;
            });
            if abandon_at.is_none() {
                abandon_at = Some(tokio::time::Instant::now() + spec.grace_period);
            }
        }

        if exit.is_some() && stdout_stream.is_none() && stderr_stream.is_none() {
            break;
        }
    }

    let duration = start.elapsed();

    // Precedence: overflow, then interrupts, then adapter errors, then the
    // exit code policy.
    if stdout_buf.overflowed || stderr_buf.overflowed {
        return Err(ExecError::BufferOverflow {
            target: target_label,
            command: command_text.to_string(),
            limit: spec.max_buffer,
        });
    }

    match interrupt {
        Some(Interrupt::TimedOut) => {
            return Err(ExecError::Timeout {
                target: target_label,
                command: command_text.to_string(),
                after: effective_timeout.unwrap_or(duration),
                stdout_tail: stdout_buf.tail_text(),
                stderr_tail: stderr_buf.tail_text(),
            });
        }
        Some(Interrupt::Cancelled) => {
            return Err(ExecError::Cancelled {
                target: target_label,
                command: command_text.to_string(),
                duration,
            });
        }
        None => {}
    }

    let status = match exit {
        Some(Ok(status)) => status,
        Some(Err(e)) => return Err(e.with_context(&target_label, command_text)),
        None => {
            return Err(ExecError::Protocol {
                target: target_label,
                message: format!("`{}` ended without an exit status", command_text),
            })
        }
    };

    debug!(
        command = %command_text,
        code = status.code,
        elapsed_ms = duration.as_millis() as u64,
        "run finished"
    );

    if status.code != 0 && spec.throw_on_non_zero {
        let mut stderr_text = String::from_utf8_lossy(&stderr_buf.data).into_owned();
        stderr_text.truncate(ERROR_STDERR_CAP);
        return Err(ExecError::Command {
            target: target_label,
            command: command_text.to_string(),
            exit_code: status.code,
            stderr: stderr_text,
            duration,
        });
    }

    Ok(ExecResult::new(
        status.code,
        status.signal,
        Bytes::from(stdout_buf.data),
        Bytes::from(stderr_buf.data),
        started_at,
        duration,
        target_label,
        command_text.to_string(),
        spec.encoding,
    ))
}

async fn next_chunk(
    stream: &mut Option<tokio_stream::wrappers::ReceiverStream<Bytes>>,
) -> Option<Bytes> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

/// Deliver a chunk according to its routing.
async fn route_chunk(
    chunk: &Bytes,
    routing: &OutputRouting,
    capture: &mut CaptureBuf,
    is_stderr: bool,
) {
    match routing {
        OutputRouting::Capture => capture.push(chunk),
        OutputRouting::Ignore => {}
        OutputRouting::Inherit => {
            // Remote targets have no real fd to inherit; forward chunks to
            // the local stdio instead.
            if is_stderr {
                let mut err = tokio::io::stderr();
                let _ = err.write_all(chunk).await;
            } else {
                let mut out = tokio::io::stdout();
                let _ = out.write_all(chunk).await;
            }
        }
        OutputRouting::Sink(writer) => {
            let mut w = writer.lock().await;
            if let Err(e) = w.write_all(chunk).await {
                debug!("sink write failed: {}", e);
            }
        }
        OutputRouting::Tee(writer) => {
            capture.push(chunk);
            let mut w = writer.lock().await;
            if let Err(e) = w.write_all(chunk).await {
                debug!("tee write failed: {}", e);
            }
        }
    }
}

/// Signal, wait out the grace period, then force a kill.
fn escalate(control: Arc<dyn ProcessControl>, kill_signal: String, grace: Duration) {
    tokio::spawn(async move {
        if let Err(e) = control.signal(&kill_signal).await {
            debug!("kill signal delivery failed: {}", e);
        }
        tokio::time::sleep(grace).await;
        if let Err(e) = control.kill().await {
            debug!("force kill failed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_buf_exact_limit_is_fine() {
        let mut buf = CaptureBuf::new(5);
        buf.push(b"12345");
        assert!(!buf.overflowed);
        assert_eq!(buf.data, b"12345");
    }

    #[test]
    fn test_capture_buf_one_byte_over_trips() {
        let mut buf = CaptureBuf::new(5);
        buf.push(b"123456");
        assert!(buf.overflowed);
        assert_eq!(buf.data, b"12345");
    }

    #[test]
    fn test_capture_buf_incremental_overflow() {
        let mut buf = CaptureBuf::new(8);
        buf.push(b"1234");
        buf.push(b"5678");
        assert!(!buf.overflowed);
        buf.push(b"9");
        assert!(buf.overflowed);
        assert_eq!(buf.data.len(), 8);
    }

    #[test]
    fn test_tail_text_caps() {
        let mut buf = CaptureBuf::new(usize::MAX);
        buf.push(&vec![b'a'; DIAGNOSTIC_TAIL_CAP * 2]);
        assert_eq!(buf.tail_text().len(), DIAGNOSTIC_TAIL_CAP);
    }
}
