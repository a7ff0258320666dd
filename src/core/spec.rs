//! The frozen description of a single run
//!
//! A [`RunSpec`] is produced by the builder at dispatch time and never
//! mutated afterwards. Adapters read it to start the process; the run
//! supervisor reads it to route output and enforce limits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::quote::{self, ShellProfile};
use super::target::{EnvMap, SudoConfig};
use crate::error::ExecError;

/// Default capture cap: 10 MiB per stream.
pub const DEFAULT_MAX_BUFFER: usize = 10 * 1024 * 1024;

/// Default grace between the kill signal and a forced KILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Boxed reader used for streaming stdin.
pub type StdinReader = Box<dyn AsyncRead + Send + Unpin>;

/// Shared writer used by `Sink`/`Tee` routing. Shared so a spec stays
/// cloneable for retries and a writer can collect several runs.
pub type SharedWriter = Arc<tokio::sync::Mutex<dyn AsyncWrite + Send + Unpin>>;

/// What to run: a shell string or an argv vector.
#[derive(Debug, Clone)]
pub enum Command {
    Shell {
        script: String,
        shell: ShellSelection,
    },
    Exec {
        argv: Vec<String>,
    },
}

impl Command {
    /// Display form used by results, events and errors.
    pub fn render(&self) -> String {
        match self {
            Command::Shell { script, .. } => script.clone(),
            Command::Exec { argv } => quote::join(ShellProfile::Posix, argv),
        }
    }
}

/// Shell program selection for shell-mode commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ShellSelection {
    /// Target default (`/bin/sh` locally, the configured pod shell on k8s, ...)
    #[default]
    Auto,
    /// A named shell program
    Named(String),
}

/// Where the child's stdin comes from.
pub enum StdinSource {
    /// Closed immediately
    Null,
    /// A fixed byte payload
    Bytes(Bytes),
    /// Streamed from an async reader (one-shot; not replayable for retries)
    Reader(StdinReader),
    /// The parent process's stdin (local targets only)
    Inherit,
}

impl std::fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdinSource::Null => write!(f, "Null"),
            StdinSource::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            StdinSource::Reader(_) => write!(f, "Reader"),
            StdinSource::Inherit => write!(f, "Inherit"),
        }
    }
}

impl StdinSource {
    pub fn is_reader(&self) -> bool {
        matches!(self, StdinSource::Reader(_))
    }

    /// Whether the child needs a writable stdin pipe.
    pub fn wants_pipe(&self) -> bool {
        matches!(self, StdinSource::Bytes(_) | StdinSource::Reader(_))
    }

    /// Clone for a retry attempt. Readers are one-shot.
    pub(crate) fn try_clone(&self) -> Option<StdinSource> {
        match self {
            StdinSource::Null => Some(StdinSource::Null),
            StdinSource::Bytes(b) => Some(StdinSource::Bytes(b.clone())),
            StdinSource::Inherit => Some(StdinSource::Inherit),
            StdinSource::Reader(_) => None,
        }
    }
}

/// Where a child output stream goes.
#[derive(Clone)]
pub enum OutputRouting {
    /// Buffer into the result (subject to `max_buffer`)
    Capture,
    /// Attach to the parent's stdio (forwarded for remote targets)
    Inherit,
    /// Discard
    Ignore,
    /// Stream into a writer; nothing captured
    Sink(SharedWriter),
    /// Capture and stream into a writer
    Tee(SharedWriter),
}

impl std::fmt::Debug for OutputRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputRouting::Capture => write!(f, "Capture"),
            OutputRouting::Inherit => write!(f, "Inherit"),
            OutputRouting::Ignore => write!(f, "Ignore"),
            OutputRouting::Sink(_) => write!(f, "Sink"),
            OutputRouting::Tee(_) => write!(f, "Tee"),
        }
    }
}

impl OutputRouting {
    /// Whether chunks count against `max_buffer`.
    pub fn captures(&self) -> bool {
        matches!(self, OutputRouting::Capture | OutputRouting::Tee(_))
    }
}

/// How the spec's env entries combine with the target's inherited env.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvMode {
    /// Inherit everything, overlay the spec's entries (default)
    #[default]
    InheritOverlay,
    /// Drop the inherited environment entirely
    ReplaceAll,
    /// Inherit, but strip names matching the sensitive deny-list first
    ReplaceSensitive,
}

/// Text handling for captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Decode text accessors as UTF-8 (lossy)
    #[default]
    Utf8,
    /// No text decoding; byte accessors only
    Raw,
}

/// Immutable description of what to run.
#[derive(Debug)]
pub struct RunSpec {
    pub command: Command,
    pub stdin: StdinSource,
    pub stdout: OutputRouting,
    pub stderr: OutputRouting,
    pub env: EnvMap,
    pub env_mode: EnvMode,
    pub cwd: Option<PathBuf>,
    /// `None` and `Some(ZERO)` both mean no timeout
    pub timeout: Option<Duration>,
    pub kill_signal: String,
    pub grace_period: Duration,
    pub encoding: Encoding,
    pub max_buffer: usize,
    pub throw_on_non_zero: bool,
    pub cancel: CancellationToken,
    pub sudo: Option<SudoConfig>,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            command: Command::Exec { argv: Vec::new() },
            stdin: StdinSource::Null,
            stdout: OutputRouting::Capture,
            stderr: OutputRouting::Capture,
            env: Vec::new(),
            env_mode: EnvMode::InheritOverlay,
            cwd: None,
            timeout: None,
            kill_signal: "TERM".to_string(),
            grace_period: DEFAULT_GRACE_PERIOD,
            encoding: Encoding::Utf8,
            max_buffer: DEFAULT_MAX_BUFFER,
            throw_on_non_zero: true,
            cancel: CancellationToken::new(),
            sudo: None,
        }
    }
}

impl RunSpec {
    /// Display form of the command, safe for logs and errors.
    pub fn render_command(&self) -> String {
        self.command.render()
    }

    /// Effective timeout: `Some` only when a positive budget is set.
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }

    /// Reject specs that cannot be executed.
    pub fn validate(&self) -> Result<(), ExecError> {
        match &self.command {
            Command::Exec { argv } if argv.is_empty() => {
                return Err(ExecError::InvalidSpec {
                    message: "empty argv".to_string(),
                })
            }
            Command::Shell { script, .. } if script.trim().is_empty() => {
                return Err(ExecError::InvalidSpec {
                    message: "empty shell command".to_string(),
                })
            }
            _ => {}
        }
        if self.max_buffer == 0 {
            return Err(ExecError::InvalidSpec {
                message: "max_buffer must be at least one byte".to_string(),
            });
        }
        Ok(())
    }

    /// Clone for a retry attempt. `None` when the spec holds a one-shot
    /// stdin reader that the previous attempt may have consumed.
    pub(crate) fn try_clone(&self) -> Option<RunSpec> {
        Some(RunSpec {
            command: self.command.clone(),
            stdin: self.stdin.try_clone()?,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            env: self.env.clone(),
            env_mode: self.env_mode,
            cwd: self.cwd.clone(),
            timeout: self.timeout,
            kill_signal: self.kill_signal.clone(),
            grace_period: self.grace_period,
            encoding: self.encoding,
            max_buffer: self.max_buffer,
            throw_on_non_zero: self.throw_on_non_zero,
            cancel: self.cancel.clone(),
            sudo: self.sudo.clone(),
        })
    }
}

// ============================================================================
// Environment composition
// ============================================================================

/// Name patterns stripped by [`EnvMode::ReplaceSensitive`]. A trailing `*`
/// matches any suffix, a leading `*` any prefix.
pub const SENSITIVE_ENV_PATTERNS: &[&str] = &[
    "AWS_*",
    "*_TOKEN",
    "*_KEY",
    "*_SECRET",
    "*_PASSWORD",
    "NPM_TOKEN",
    "GITHUB_TOKEN",
];

fn matches_pattern(name: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else {
        name == pattern
    }
}

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_ENV_PATTERNS
        .iter()
        .any(|p| matches_pattern(name, p))
}

/// Combine an inherited environment with the spec's overlay according to
/// the env mode. Later entries win; the overlay always wins over inherited
/// values.
pub fn compose_env(
    inherited: impl IntoIterator<Item = (String, String)>,
    overlay: &EnvMap,
    mode: EnvMode,
) -> EnvMap {
    let mut out: EnvMap = Vec::new();
    match mode {
        EnvMode::ReplaceAll => {}
        EnvMode::InheritOverlay => out.extend(inherited),
        EnvMode::ReplaceSensitive => {
            out.extend(inherited.into_iter().filter(|(k, _)| !is_sensitive(k)))
        }
    }
    for (key, value) in overlay {
        out.retain(|(k, _)| k != key);
        out.push((key.clone(), value.clone()));
    }
    out
}
