//! Local process adapter
//!
//! Spawns children on the host with `tokio::process`. Signals are
//! delivered by pid; on timeout the supervisor escalates from the
//! configured kill signal to SIGKILL.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{
    normalize_signal, signal_name, signal_number, spawn_reader_pump, spawn_stdin_feed, Adapter,
    ExitStatus, ProcessControl, RunHandle, CHUNK_CHANNEL_CAPACITY,
};
use crate::core::{
    compose_env, Command, EnvMode, LocalConfig, OutputRouting, RunSpec, ShellSelection,
    StdinSource, Target, TargetKind,
};
use crate::error::ExecError;

const DEFAULT_SHELL: &str = "/bin/sh";

pub struct LocalAdapter;

impl LocalAdapter {
    pub fn new() -> Self {
        Self
    }

    fn resolve_argv(spec: &RunSpec, cfg: &LocalConfig) -> Result<Vec<String>, ExecError> {
        match &spec.command {
            Command::Shell { script, shell } => {
                let program = match shell {
                    ShellSelection::Named(name) => name.clone(),
                    ShellSelection::Auto => cfg
                        .shell
                        .clone()
                        .or_else(|| cfg.preferred_runtime.clone())
                        .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
                };
                Ok(vec![program, "-c".to_string(), script.clone()])
            }
            Command::Exec { argv } => Ok(argv.clone()),
        }
    }

    fn stdio_for(routing: &OutputRouting) -> Stdio {
        match routing {
            OutputRouting::Inherit => Stdio::inherit(),
            OutputRouting::Ignore => Stdio::null(),
            _ => Stdio::piped(),
        }
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Local
    }

    async fn execute(&self, target: &Target, spec: &mut RunSpec) -> Result<RunHandle, ExecError> {
        let cfg = match target {
            Target::Local(cfg) => cfg,
            other => {
                return Err(ExecError::InvalidSpec {
                    message: format!("local adapter handed a {} target", other.kind()),
                })
            }
        };

        let argv = Self::resolve_argv(spec, cfg)?;
        let rendered = spec.render_command();

        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.kill_on_drop(true);

        match spec.env_mode {
            EnvMode::InheritOverlay => {
                for (key, value) in &spec.env {
                    command.env(key, value);
                }
            }
            EnvMode::ReplaceAll | EnvMode::ReplaceSensitive => {
                command.env_clear();
                for (key, value) in compose_env(std::env::vars(), &spec.env, spec.env_mode) {
                    command.env(key, value);
                }
            }
        }

        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        #[cfg(unix)]
        {
            if let Some(uid) = cfg.uid {
                command.uid(uid);
            }
            if let Some(gid) = cfg.gid {
                command.gid(gid);
            }
        }

        command.stdin(match &spec.stdin {
            StdinSource::Inherit => Stdio::inherit(),
            StdinSource::Null => Stdio::null(),
            _ => Stdio::piped(),
        });
        command.stdout(Self::stdio_for(&spec.stdout));
        command.stderr(Self::stdio_for(&spec.stderr));

        let mut child = command.spawn().map_err(|e| ExecError::Spawn {
            target: target.describe(),
            command: rendered.clone(),
            source: e,
        })?;

        let pid = child.id();
        debug!(pid, command = %rendered, "spawned local process");

        // Stdin: hand the payload to a feed task if the child has a pipe.
        let stdin_source = std::mem::replace(&mut spec.stdin, StdinSource::Null);
        if let Some(writer) = child.stdin.take() {
            spawn_stdin_feed(writer, None, stdin_source);
        }

        let stdout_rx = child.stdout.take().map(|out| {
            let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
            spawn_reader_pump(out, tx);
            rx
        });
        let stderr_rx = child.stderr.take().map(|err| {
            let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
            spawn_reader_pump(err, tx);
            rx
        });

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = match child.wait().await {
                Ok(status) => Ok(exit_status_from(status)),
                Err(e) => Err(ExecError::Protocol {
                    target: String::new(),
                    message: format!("wait failed: {}", e),
                }),
            };
            let _ = exit_tx.send(result);
        });

        let control = Arc::new(LocalControl { pid });
        Ok(RunHandle::new(pid, stdout_rx, stderr_rx, exit_rx, control))
    }
}

fn exit_status_from(status: std::process::ExitStatus) -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ExitStatus::signalled(signal_name(sig), sig);
        }
    }
    ExitStatus::clean(status.code().unwrap_or(-1))
}

/// Signal delivery by pid.
struct LocalControl {
    pid: Option<u32>,
}

#[async_trait]
impl ProcessControl for LocalControl {
    async fn signal(&self, signal: &str) -> Result<(), ExecError> {
        let name = normalize_signal(signal);
        let number = signal_number(&name).ok_or_else(|| ExecError::InvalidSpec {
            message: format!("unknown signal {}", signal),
        })?;
        deliver(self.pid, number)
    }

    async fn kill(&self) -> Result<(), ExecError> {
        deliver(self.pid, 9)
    }
}

#[cfg(unix)]
fn deliver(pid: Option<u32>, number: i32) -> Result<(), ExecError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = match pid {
        Some(pid) => pid as i32,
        // Already reaped; nothing to signal.
        None => return Ok(()),
    };
    let signal = Signal::try_from(number).map_err(|e| ExecError::InvalidSpec {
        message: format!("signal {}: {}", number, e),
    })?;
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(()),
        // ESRCH: the process exited between wait and delivery.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ExecError::Protocol {
            target: "local".to_string(),
            message: format!("kill({}, {}) failed: {}", pid, number, e),
        }),
    }
}

#[cfg(not(unix))]
fn deliver(_pid: Option<u32>, _number: i32) -> Result<(), ExecError> {
    // Windows has no per-signal delivery; the supervisor's escalation path
    // ends in a forcible kill which tokio implements portably.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_stream::StreamExt;

    use crate::core::LocalConfig;

    fn local_target() -> Target {
        Target::Local(LocalConfig::default())
    }

    fn shell_spec(script: &str) -> RunSpec {
        RunSpec {
            command: Command::Shell {
                script: script.to_string(),
                shell: ShellSelection::Auto,
            },
            ..RunSpec::default()
        }
    }

    async fn drain(handle: &mut RunHandle) -> (Vec<u8>, Vec<u8>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut s) = handle.take_stdout() {
            while let Some(chunk) = s.next().await {
                stdout.extend_from_slice(&chunk);
            }
        }
        if let Some(mut s) = handle.take_stderr() {
            while let Some(chunk) = s.next().await {
                stderr.extend_from_slice(&chunk);
            }
        }
        (stdout, stderr)
    }

    #[tokio::test]
    async fn test_echo_captures_stdout() {
        let adapter = LocalAdapter::new();
        let target = local_target();
        let mut spec = shell_spec("echo hello");
        let mut handle = adapter.execute(&target, &mut spec).await.unwrap();

        let (stdout, stderr) = drain(&mut handle).await;
        let status = handle.wait().await.unwrap();
        assert_eq!(status.code, 0);
        assert_eq!(stdout, b"hello\n");
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn test_exec_argv_without_shell() {
        let adapter = LocalAdapter::new();
        let target = local_target();
        let mut spec = RunSpec {
            command: Command::Exec {
                argv: vec!["echo".to_string(), "a b".to_string()],
            },
            ..RunSpec::default()
        };
        let mut handle = adapter.execute(&target, &mut spec).await.unwrap();
        let (stdout, _) = drain(&mut handle).await;
        assert_eq!(stdout, b"a b\n");
        assert_eq!(handle.wait().await.unwrap().code, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_reported() {
        let adapter = LocalAdapter::new();
        let target = local_target();
        let mut spec = shell_spec("exit 7");
        let mut handle = adapter.execute(&target, &mut spec).await.unwrap();
        drain(&mut handle).await;
        assert_eq!(handle.wait().await.unwrap().code, 7);
    }

    #[tokio::test]
    async fn test_spawn_error_for_missing_program() {
        let adapter = LocalAdapter::new();
        let target = local_target();
        let mut spec = RunSpec {
            command: Command::Exec {
                argv: vec!["/nonexistent/program-xyz".to_string()],
            },
            ..RunSpec::default()
        };
        let err = adapter.execute(&target, &mut spec).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_stdin_bytes_reach_child() {
        let adapter = LocalAdapter::new();
        let target = local_target();
        let mut spec = shell_spec("cat");
        spec.stdin = StdinSource::Bytes(Bytes::from_static(b"piped input"));
        let mut handle = adapter.execute(&target, &mut spec).await.unwrap();
        let (stdout, _) = drain(&mut handle).await;
        assert_eq!(stdout, b"piped input");
        assert_eq!(handle.wait().await.unwrap().code, 0);
    }

    #[tokio::test]
    async fn test_env_overlay_visible_to_child() {
        let adapter = LocalAdapter::new();
        let target = local_target();
        let mut spec = shell_spec("printf '%s' \"$XEC_TEST_VAR\"");
        spec.env = vec![("XEC_TEST_VAR".to_string(), "42".to_string())];
        let mut handle = adapter.execute(&target, &mut spec).await.unwrap();
        let (stdout, _) = drain(&mut handle).await;
        assert_eq!(stdout, b"42");
    }

    #[tokio::test]
    async fn test_env_replace_all_drops_inherited() {
        let adapter = LocalAdapter::new();
        let target = local_target();
        std::env::set_var("XEC_INHERITED_MARKER", "present");
        let mut spec = shell_spec("printf '%s' \"${XEC_INHERITED_MARKER:-absent}\"");
        spec.env_mode = EnvMode::ReplaceAll;
        let mut handle = adapter.execute(&target, &mut spec).await.unwrap();
        let (stdout, _) = drain(&mut handle).await;
        assert_eq!(stdout, b"absent");
        std::env::remove_var("XEC_INHERITED_MARKER");
    }

    #[tokio::test]
    async fn test_cwd_applies_on_target() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalAdapter::new();
        let target = local_target();
        let mut spec = shell_spec("pwd");
        spec.cwd = Some(dir.path().to_path_buf());
        let mut handle = adapter.execute(&target, &mut spec).await.unwrap();
        let (stdout, _) = drain(&mut handle).await;
        let printed = String::from_utf8_lossy(&stdout);
        let printed = printed.trim_end();
        assert_eq!(
            std::fs::canonicalize(printed).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_terminates_child() {
        let adapter = LocalAdapter::new();
        let target = local_target();
        let mut spec = shell_spec("sleep 30");
        let mut handle = adapter.execute(&target, &mut spec).await.unwrap();

        handle.signal("TERM").await.unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(status.signal.as_deref(), Some("TERM"));
        assert_eq!(status.code, 143);
    }

    #[tokio::test]
    async fn test_ignore_routing_produces_no_stream() {
        let adapter = LocalAdapter::new();
        let target = local_target();
        let mut spec = shell_spec("echo ignored");
        spec.stdout = OutputRouting::Ignore;
        let mut handle = adapter.execute(&target, &mut spec).await.unwrap();
        assert!(handle.take_stdout().is_none());
        assert_eq!(handle.wait().await.unwrap().code, 0);
    }
}
