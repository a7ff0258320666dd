//! Error taxonomy for the execution engine
//!
//! Every error that crosses an adapter boundary carries the target
//! description and the sanitized command text. Secrets (sudo passwords,
//! key passphrases, askpass script contents) are never embedded in
//! command strings in the first place, so nothing here needs scrubbing
//! after the fact.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Machine-friendly tag for an [`ExecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Spawn,
    Auth,
    Connect,
    Protocol,
    Command,
    Timeout,
    Cancelled,
    BufferOverflow,
    PoolExhausted,
    InvalidSpec,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ErrorKind::Spawn => "spawn",
            ErrorKind::Auth => "auth",
            ErrorKind::Connect => "connect",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Command => "command",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BufferOverflow => "buffer-overflow",
            ErrorKind::PoolExhausted => "pool-exhausted",
            ErrorKind::InvalidSpec => "invalid-spec",
        };
        write!(f, "{}", tag)
    }
}

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum ExecError {
    /// Local process creation failed (ENOENT, EPERM, ...)
    #[error("failed to spawn `{command}` on {target}: {source}")]
    Spawn {
        target: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// SSH authentication exhausted every configured method
    #[error("authentication failed for {target}: {message}")]
    Auth { target: String, message: String },

    /// Transport handshake failed (TCP, TLS, SSH key exchange, Docker/k8s client connect)
    #[error("failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    /// Malformed framing or an unexpected message on a remote stream
    #[error("protocol error on {target}: {message}")]
    Protocol { target: String, message: String },

    /// Process exited non-zero while `throw_on_non_zero` was set
    #[error("command `{command}` on {target} exited with code {exit_code}")]
    Command {
        target: String,
        command: String,
        exit_code: i32,
        /// Captured stderr, capped for diagnostics
        stderr: String,
        duration: Duration,
    },

    /// The wall-clock budget elapsed before the process terminated
    #[error("command `{command}` on {target} timed out after {after:?}")]
    Timeout {
        target: String,
        command: String,
        after: Duration,
        stdout_tail: String,
        stderr_tail: String,
    },

    /// The run was cancelled externally
    #[error("command `{command}` on {target} was cancelled")]
    Cancelled {
        target: String,
        command: String,
        duration: Duration,
    },

    /// A captured stream exceeded `max_buffer`
    #[error("output of `{command}` on {target} exceeded the {limit} byte capture limit")]
    BufferOverflow {
        target: String,
        command: String,
        limit: usize,
    },

    /// The pool could not admit the borrow before `acquire_timeout`
    #[error("connection pool exhausted for {target} after waiting {waited:?}")]
    PoolExhausted { target: String, waited: Duration },

    /// The run specification was rejected at build time
    #[error("invalid run specification: {message}")]
    InvalidSpec { message: String },
}

impl ExecError {
    /// Machine-friendly kind tag.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Spawn { .. } => ErrorKind::Spawn,
            ExecError::Auth { .. } => ErrorKind::Auth,
            ExecError::Connect { .. } => ErrorKind::Connect,
            ExecError::Protocol { .. } => ErrorKind::Protocol,
            ExecError::Command { .. } => ErrorKind::Command,
            ExecError::Timeout { .. } => ErrorKind::Timeout,
            ExecError::Cancelled { .. } => ErrorKind::Cancelled,
            ExecError::BufferOverflow { .. } => ErrorKind::BufferOverflow,
            ExecError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            ExecError::InvalidSpec { .. } => ErrorKind::InvalidSpec,
        }
    }

    /// Whether the error class is retryable by default.
    ///
    /// Command failures are retryable only when the caller opts in through
    /// the builder's retry policy; timeouts are retryable but bounded by the
    /// same policy.
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connect | ErrorKind::Timeout | ErrorKind::PoolExhausted
        )
    }

    /// Exit code for command failures, `None` for every other kind.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Command { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Fill in target/command context on errors produced below the adapter
    /// boundary, where neither is known yet. Existing context wins.
    pub(crate) fn with_context(self, target: &str, command: &str) -> Self {
        match self {
            ExecError::Connect { target: t, message } if t.is_empty() => ExecError::Connect {
                target: target.to_string(),
                message,
            },
            ExecError::Protocol { target: t, message } if t.is_empty() => ExecError::Protocol {
                target: target.to_string(),
                message,
            },
            ExecError::Auth { target: t, message } if t.is_empty() => ExecError::Auth {
                target: target.to_string(),
                message,
            },
            ExecError::Spawn {
                target: t,
                command: c,
                source,
            } if t.is_empty() => ExecError::Spawn {
                target: target.to_string(),
                command: if c.is_empty() { command.to_string() } else { c },
                source,
            },
            other => other,
        }
    }
}

// russh surfaces through the client handler, which requires its error type
// to absorb transport errors. Target context is attached by the adapter.
impl From<russh::Error> for ExecError {
    fn from(e: russh::Error) -> Self {
        ExecError::Connect {
            target: String::new(),
            message: e.to_string(),
        }
    }
}

pub type ExecResultOf<T> = std::result::Result<T, ExecError>;

/// Map a bollard error into the taxonomy. Connection-level failures become
/// [`ExecError::Connect`], malformed payloads [`ExecError::Protocol`].
pub(crate) fn docker_error(target: &str, e: bollard::errors::Error) -> ExecError {
    use bollard::errors::Error as DockerError;
    match e {
        DockerError::HyperResponseError { .. }
        | DockerError::RequestTimeoutError
        | DockerError::IOError { .. } => ExecError::Connect {
            target: target.to_string(),
            message: e.to_string(),
        },
        other => ExecError::Protocol {
            target: target.to_string(),
            message: other.to_string(),
        },
    }
}

/// Map a kube client error into the taxonomy.
pub(crate) fn kube_error(target: &str, e: kube::Error) -> ExecError {
    match e {
        kube::Error::Auth(e) => ExecError::Auth {
            target: target.to_string(),
            message: e.to_string(),
        },
        kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::InferConfig(_) => {
            ExecError::Connect {
                target: target.to_string(),
                message: e.to_string(),
            }
        }
        other => ExecError::Protocol {
            target: target.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let err = ExecError::Timeout {
            target: "local".into(),
            command: "sleep 5".into(),
            after: Duration::from_millis(100),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.kind().to_string(), "timeout");
        assert!(err.retryable());
    }

    #[test]
    fn test_command_error_not_retryable() {
        let err = ExecError::Command {
            target: "local".into(),
            command: "false".into(),
            exit_code: 1,
            stderr: String::new(),
            duration: Duration::from_millis(5),
        };
        assert!(!err.retryable());
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_with_context_fills_empty_target() {
        let err = ExecError::Connect {
            target: String::new(),
            message: "connection refused".into(),
        };
        let err = err.with_context("ssh://user@host:22", "uptime");
        match err {
            ExecError::Connect { target, .. } => assert_eq!(target, "ssh://user@host:22"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_with_context_keeps_existing_target() {
        let err = ExecError::Protocol {
            target: "docker://c1".into(),
            message: "bad frame".into(),
        };
        let err = err.with_context("other", "cmd");
        match err {
            ExecError::Protocol { target, .. } => assert_eq!(target, "docker://c1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
