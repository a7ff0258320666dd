//! Kubernetes adapter
//!
//! Runs commands through the `pods/{name}/exec` subresource over the kube
//! client's upgraded connection (channels 0-4: stdin, stdout, stderr,
//! status, resize). Commands are always argv; env and cwd are realized by
//! argv wrapping because the exec API carries neither.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    argv_for_exec, normalize_signal, spawn_reader_pump, spawn_stdin_feed, wrap_argv, Adapter,
    ExitStatus, ProcessControl, RunHandle, CHUNK_CHANNEL_CAPACITY,
};
use crate::core::{K8sConfig, RunSpec, StdinSource, Target, TargetKind};
use crate::error::{kube_error, ExecError};
use crate::pool::ConnectionPool;

const STREAM_BUF_SIZE: usize = 1024 * 1024;

pub struct KubernetesAdapter {
    pool: ConnectionPool,
}

impl KubernetesAdapter {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }
}

/// Build a client from the target's kubeconfig/context, observing
/// `KUBECONFIG`. Used by the engine's connection factory.
pub(crate) async fn connect_k8s(cfg: &K8sConfig) -> Result<kube::Client, ExecError> {
    let target = format!("k8s context {}", cfg.context.as_deref().unwrap_or("current"));

    if cfg.kubeconfig.is_none() && cfg.context.is_none() {
        return kube::Client::try_default()
            .await
            .map_err(|e| kube_error(&target, e));
    }

    let kubeconfig = match &cfg.kubeconfig {
        Some(path) => Kubeconfig::read_from(path).map_err(|e| ExecError::Connect {
            target: target.clone(),
            message: format!("cannot read kubeconfig {}: {}", path.display(), e),
        })?,
        None => Kubeconfig::read().map_err(|e| ExecError::Connect {
            target: target.clone(),
            message: format!("cannot read kubeconfig: {}", e),
        })?,
    };

    let options = KubeConfigOptions {
        context: cfg.context.clone(),
        cluster: None,
        user: None,
    };
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| ExecError::Connect {
            target: target.clone(),
            message: e.to_string(),
        })?;
    kube::Client::try_from(config).map_err(|e| kube_error(&target, e))
}

/// Exit code from the channel-3 status message. `Success` is zero;
/// `NonZeroExitCode` carries the code in `details.causes[reason=ExitCode]`.
fn exit_code_from_status(status: Option<Status>) -> i32 {
    let Some(status) = status else {
        // Server closed the status channel without a message; the streams
        // ended cleanly, so treat it as success.
        return 0;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    if let Some(details) = &status.details {
        if let Some(causes) = &details.causes {
            for cause in causes {
                if cause.reason.as_deref() == Some("ExitCode") {
                    if let Some(code) = cause.message.as_deref().and_then(|m| m.trim().parse().ok())
                    {
                        return code;
                    }
                }
            }
        }
    }
    // Failure without a parseable code (e.g. container not found).
    1
}

#[async_trait]
impl Adapter for KubernetesAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Kubernetes
    }

    async fn execute(&self, target: &Target, spec: &mut RunSpec) -> Result<RunHandle, ExecError> {
        let cfg = match target {
            Target::Kubernetes(cfg) => cfg,
            other => {
                return Err(ExecError::InvalidSpec {
                    message: format!("kubernetes adapter handed a {} target", other.kind()),
                })
            }
        };

        let guard = self.pool.acquire(target).await?;
        let client = guard
            .as_kubernetes()
            .cloned()
            .ok_or_else(|| ExecError::Protocol {
                target: target.describe(),
                message: "pool returned a non-kubernetes connection".to_string(),
            })?;

        let argv = wrap_argv(
            argv_for_exec(&spec.command, &cfg.shell),
            &spec.env,
            spec.env_mode,
            spec.cwd.as_deref().or(cfg.cwd.as_deref()),
        );

        let wants_stdin = spec.stdin.wants_pipe();
        let params = AttachParams {
            container: cfg.container.clone(),
            tty: false,
            stdin: wants_stdin,
            stdout: true,
            stderr: true,
            max_stdin_buf_size: Some(STREAM_BUF_SIZE),
            max_stdout_buf_size: Some(STREAM_BUF_SIZE),
            max_stderr_buf_size: Some(STREAM_BUF_SIZE),
        };

        let pods: Api<Pod> = Api::namespaced(client, &cfg.namespace);
        let mut attached = pods
            .exec(&cfg.pod, argv.clone(), &params)
            .await
            .map_err(|e| kube_error(&target.describe(), e))?;
        debug!(pod = %cfg.pod, namespace = %cfg.namespace, ?argv, "pod exec started");

        let stdin_source = std::mem::replace(&mut spec.stdin, StdinSource::Null);
        if wants_stdin {
            if let Some(writer) = attached.stdin() {
                spawn_stdin_feed(writer, None, stdin_source);
            }
        }

        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Some(stdout) = attached.stdout() {
            spawn_reader_pump(stdout, stdout_tx);
        }
        if let Some(stderr) = attached.stderr() {
            spawn_reader_pump(stderr, stderr_tx);
        }

        let kill_token = CancellationToken::new();
        let pump_token = kill_token.clone();
        let status_fut = attached.take_status();
        tokio::spawn(async move {
            let _guard = guard;

            let status = tokio::select! {
                status = async {
                    match status_fut {
                        Some(fut) => fut.await,
                        None => None,
                    }
                } => status,
                _ = pump_token.cancelled() => {
                    // Closing every channel is the only terminate k8s exec
                    // offers; the kubelet tears the process down.
                    drop(attached);
                    let _ = exit_tx.send(Ok(ExitStatus::signalled("KILL", 9)));
                    return;
                }
            };

            let code = exit_code_from_status(status);
            if let Err(e) = attached.join().await {
                debug!("attached process join: {}", e);
            }
            let _ = exit_tx.send(Ok(ExitStatus::clean(code)));
        });

        let control = Arc::new(K8sControl { kill: kill_token });
        Ok(RunHandle::new(
            None,
            Some(stdout_rx),
            Some(stderr_rx),
            exit_rx,
            control,
        ))
    }
}

/// The exec protocol has no signal channel; terminating means closing the
/// multiplexed connection.
struct K8sControl {
    kill: CancellationToken,
}

#[async_trait]
impl ProcessControl for K8sControl {
    async fn signal(&self, signal: &str) -> Result<(), ExecError> {
        match normalize_signal(signal).as_str() {
            "TERM" | "KILL" | "INT" | "HUP" => {
                self.kill.cancel();
                Ok(())
            }
            other => {
                warn!("kubernetes exec cannot deliver {}; ignoring", other);
                Ok(())
            }
        }
    }

    async fn kill(&self) -> Result<(), ExecError> {
        self.kill.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    fn status(value: &str) -> Status {
        Status {
            status: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_exit_code_success() {
        assert_eq!(exit_code_from_status(Some(status("Success"))), 0);
        assert_eq!(exit_code_from_status(None), 0);
    }

    #[test]
    fn test_exit_code_from_causes() {
        let mut failure = status("Failure");
        failure.reason = Some("NonZeroExitCode".to_string());
        failure.details = Some(StatusDetails {
            causes: Some(vec![StatusCause {
                reason: Some("ExitCode".to_string()),
                message: Some("7".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(exit_code_from_status(Some(failure)), 7);
    }

    #[test]
    fn test_exit_code_failure_without_cause_defaults_to_one() {
        let mut failure = status("Failure");
        failure.message = Some("container not found".to_string());
        assert_eq!(exit_code_from_status(Some(failure)), 1);
    }

    #[test]
    fn test_shell_mode_wraps_with_configured_shell() {
        let spec = RunSpec {
            command: crate::core::Command::Shell {
                script: "printf a; printf b >&2; printf c".to_string(),
                shell: crate::core::ShellSelection::Auto,
            },
            ..RunSpec::default()
        };
        let cfg = K8sConfig::pod("n", "p");
        let argv = wrap_argv(
            argv_for_exec(&spec.command, &cfg.shell),
            &spec.env,
            spec.env_mode,
            None,
        );
        assert_eq!(argv, vec!["sh", "-c", "printf a; printf b >&2; printf c"]);
    }

    #[test]
    fn test_env_and_cwd_wrapping() {
        let mut spec = RunSpec {
            command: crate::core::Command::Exec {
                argv: vec!["ls".to_string()],
            },
            ..RunSpec::default()
        };
        spec.env = vec![("K".to_string(), "V".to_string())];
        let argv = wrap_argv(
            argv_for_exec(&spec.command, "sh"),
            &spec.env,
            spec.env_mode,
            Some(std::path::Path::new("/data")),
        );
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[2], "cd /data && exec env K=V ls");
    }
}
