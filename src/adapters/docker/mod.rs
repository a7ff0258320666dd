//! Docker adapter
//!
//! Two modes against a bollard client borrowed from the pool: exec inside
//! an existing container, or run an ephemeral one
//! (create → attach → start → wait → remove). The multiplexed stream
//! demultiplexing (`[stream, 0,0,0, len]` frames) is handled by bollard's
//! codec; this adapter routes the demuxed chunks.

mod daemon;

pub use daemon::DockerConnection;
pub(crate) use daemon::connect_daemon;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    argv_for_exec, normalize_signal, spawn_stdin_feed, wrap_argv, Adapter, ExitStatus,
    ProcessControl, RunHandle, CHUNK_CHANNEL_CAPACITY,
};
use crate::core::{
    DockerConfig, DockerMode, EnvMode, OutputRouting, RunSpec, StdinSource, Target, TargetKind,
};
use crate::error::{docker_error, ExecError};
use crate::pool::ConnectionPool;

const DEFAULT_CONTAINER_SHELL: &str = "/bin/sh";

/// How long to poll exec inspect for a missing exit code after EOF.
const EXIT_POLL_BUDGET: Duration = Duration::from_secs(10);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct DockerAdapter {
    pool: ConnectionPool,
}

impl DockerAdapter {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Docker
    }

    async fn execute(&self, target: &Target, spec: &mut RunSpec) -> Result<RunHandle, ExecError> {
        let cfg = match target {
            Target::Docker(cfg) => cfg,
            other => {
                return Err(ExecError::InvalidSpec {
                    message: format!("docker adapter handed a {} target", other.kind()),
                })
            }
        };

        // A TTY collapses stderr into the raw stream; an explicit separate
        // stderr consumer cannot be honored.
        if cfg.tty
            && matches!(
                spec.stderr,
                OutputRouting::Sink(_) | OutputRouting::Tee(_)
            )
        {
            return Err(ExecError::InvalidSpec {
                message: "tty mode merges stderr into stdout; a separate stderr sink cannot work"
                    .to_string(),
            });
        }

        let guard = self.pool.acquire(target).await?;
        let connection = guard
            .as_docker()
            .cloned()
            .ok_or_else(|| ExecError::Protocol {
                target: target.describe(),
                message: "pool returned a non-docker connection".to_string(),
            })?;

        // The guard travels into the pump task so the borrow spans the run.
        match effective_mode(cfg) {
            DockerMode::Exec => self.exec_in_existing(target, cfg, spec, connection, guard).await,
            DockerMode::Ephemeral => self.run_ephemeral(target, cfg, spec, connection, guard).await,
        }
    }
}

/// `container` set wins over a configured mode; `image` alone implies
/// ephemeral.
fn effective_mode(cfg: &DockerConfig) -> DockerMode {
    match (&cfg.container, &cfg.image) {
        (Some(_), _) => DockerMode::Exec,
        (None, Some(_)) => DockerMode::Ephemeral,
        (None, None) => cfg.mode,
    }
}

/// Resolve argv plus native env/cwd options for the engine API. A full
/// environment replacement has no API equivalent and wraps through `env -i`.
fn argv_and_env(
    spec: &RunSpec,
    cfg: &DockerConfig,
) -> (Vec<String>, Option<Vec<String>>, Option<String>) {
    let argv = argv_for_exec(&spec.command, DEFAULT_CONTAINER_SHELL);
    let cwd = spec
        .cwd
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| cfg.cwd.as_ref().map(|p| p.to_string_lossy().into_owned()));

    if matches!(spec.env_mode, EnvMode::ReplaceAll) {
        let argv = wrap_argv(argv, &spec.env, spec.env_mode, None);
        (argv, None, cwd)
    } else {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        (argv, (!env.is_empty()).then_some(env), cwd)
    }
}

impl DockerAdapter {
    async fn exec_in_existing(
        &self,
        target: &Target,
        cfg: &DockerConfig,
        spec: &mut RunSpec,
        connection: DockerConnection,
        guard: crate::pool::PoolGuard,
    ) -> Result<RunHandle, ExecError> {
        let container = cfg.container.clone().ok_or_else(|| ExecError::InvalidSpec {
            message: "docker exec mode requires a container".to_string(),
        })?;
        let docker = connection.client().clone();
        let described = target.describe();

        let (argv, env, working_dir) = argv_and_env(spec, cfg);
        let attach_stdin = spec.stdin.wants_pipe();

        let exec = docker
            .create_exec(
                &container,
                CreateExecOptions {
                    attach_stdin: Some(attach_stdin),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(cfg.tty),
                    cmd: Some(argv),
                    env,
                    working_dir,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_error(&described, e))?;

        let started = docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| docker_error(&described, e))?;

        let (mut output, input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(ExecError::Protocol {
                    target: described,
                    message: "exec started detached despite attach request".to_string(),
                })
            }
        };

        // Best-effort pid for the handle.
        let pid = docker
            .inspect_exec(&exec.id)
            .await
            .ok()
            .and_then(|i| i.pid)
            .and_then(|p| u32::try_from(p).ok());

        let stdin_source = std::mem::replace(&mut spec.stdin, StdinSource::Null);
        if attach_stdin {
            spawn_stdin_feed(input, None, stdin_source);
        }

        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let exec_id = exec.id.clone();
        let pump_docker = docker.clone();
        let pump_target = target.describe();
        tokio::spawn(async move {
            let _guard = guard;

            let mut stream_error: Option<ExecError> = None;
            while let Some(item) = output.next().await {
                match item {
                    Ok(log) => route_log_output(log, &stdout_tx, &stderr_tx).await,
                    Err(e) => {
                        stream_error = Some(docker_error(&pump_target, e));
                        break;
                    }
                }
            }
            drop(stdout_tx);
            drop(stderr_tx);

            if let Some(e) = stream_error {
                let _ = exit_tx.send(Err(e));
                return;
            }

            // The stream closing usually means the process exited; inspect
            // until the daemon agrees and reports the code.
            let deadline = tokio::time::Instant::now() + EXIT_POLL_BUDGET;
            let mut exit_code: i64 = -1;
            loop {
                match pump_docker.inspect_exec(&exec_id).await {
                    Ok(info) => {
                        if info.running != Some(true) {
                            exit_code = info.exit_code.unwrap_or(-1);
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = exit_tx.send(Err(docker_error(&pump_target, e)));
                        return;
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!("exec {} still running after stream end", exec_id);
                    break;
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }

            let _ = exit_tx.send(Ok(ExitStatus::clean(exit_code as i32)));
        });

        let control = Arc::new(DockerControl {
            docker,
            container,
        });
        Ok(RunHandle::new(
            pid,
            Some(stdout_rx),
            Some(stderr_rx),
            exit_rx,
            control,
        ))
    }

    async fn run_ephemeral(
        &self,
        target: &Target,
        cfg: &DockerConfig,
        spec: &mut RunSpec,
        connection: DockerConnection,
        guard: crate::pool::PoolGuard,
    ) -> Result<RunHandle, ExecError> {
        let image = cfg.image.clone().ok_or_else(|| ExecError::InvalidSpec {
            message: "docker ephemeral mode requires an image".to_string(),
        })?;
        let docker = connection.client().clone();
        let described = target.describe();

        let (argv, env, working_dir) = argv_and_env(spec, cfg);
        let name = format!("xec-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let wants_stdin = spec.stdin.wants_pipe();

        let (exposed_ports, port_bindings) = port_maps(&cfg.ports)?;
        let host_config = HostConfig {
            binds: (!cfg.binds.is_empty()).then(|| cfg.binds.clone()),
            port_bindings,
            // Removal is explicit after wait so the exit code survives.
            auto_remove: Some(false),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(image.clone()),
            cmd: Some(argv),
            env,
            working_dir,
            exposed_ports,
            attach_stdin: Some(wants_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(wants_stdin),
            stdin_once: Some(true),
            tty: Some(cfg.tty),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        // Missing image: pull once and retry the create.
        let created = match docker
            .create_container(Some(options.clone()), container_config.clone())
            .await
        {
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                pull_image(&docker, &image, &described).await?;
                docker
                    .create_container(Some(options), container_config)
                    .await
                    .map_err(|e| docker_error(&described, e))?
            }
            other => other.map_err(|e| docker_error(&described, e))?,
        };
        debug!(container = %name, id = %created.id, "created ephemeral container");

        // Attach before start so the first output bytes are not lost.
        let attach = docker
            .attach_container(
                &name,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(wants_stdin),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| docker_error(&described, e))?;
        let AttachContainerResults { mut output, input } = attach;

        if let Err(e) = docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(docker_error(&described, e));
        }

        let stdin_source = std::mem::replace(&mut spec.stdin, StdinSource::Null);
        if wants_stdin {
            spawn_stdin_feed(input, None, stdin_source);
        }

        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let pump_docker = docker.clone();
        let pump_name = name.clone();
        let pump_target = described.clone();
        let auto_remove = cfg.auto_remove;
        tokio::spawn(async move {
            let _guard = guard;

            let drain = async {
                while let Some(item) = output.next().await {
                    match item {
                        Ok(log) => route_log_output(log, &stdout_tx, &stderr_tx).await,
                        Err(e) => {
                            debug!("attach stream ended: {}", e);
                            break;
                        }
                    }
                }
            };

            let wait = async {
                let mut stream = pump_docker.wait_container(
                    &pump_name,
                    Some(WaitContainerOptions {
                        condition: "not-running",
                    }),
                );
                match stream.next().await {
                    Some(Ok(response)) => Ok(response.status_code),
                    Some(Err(bollard::errors::Error::DockerContainerWaitError {
                        code, ..
                    })) => Ok(code),
                    Some(Err(e)) => Err(docker_error(&pump_target, e)),
                    None => Ok(-1),
                }
            };

            let (_, wait_result) = tokio::join!(drain, wait);
            drop(stdout_tx);
            drop(stderr_tx);

            if auto_remove {
                if let Err(e) = pump_docker
                    .remove_container(
                        &pump_name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await
                {
                    match e {
                        bollard::errors::Error::DockerResponseServerError {
                            status_code: 404 | 409,
                            ..
                        } => {}
                        other => warn!("failed to remove ephemeral container: {}", other),
                    }
                }
            }

            let _ = exit_tx.send(wait_result.map(|code| ExitStatus::clean(code as i32)));
        });

        let control = Arc::new(DockerControl {
            docker,
            container: name,
        });
        Ok(RunHandle::new(
            None,
            Some(stdout_rx),
            Some(stderr_rx),
            exit_rx,
            control,
        ))
    }
}

async fn route_log_output(
    log: bollard::container::LogOutput,
    stdout_tx: &mpsc::Sender<Bytes>,
    stderr_tx: &mpsc::Sender<Bytes>,
) {
    use bollard::container::LogOutput;
    match log {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            let _ = stdout_tx.send(message).await;
        }
        LogOutput::StdErr { message } => {
            let _ = stderr_tx.send(message).await;
        }
        LogOutput::StdIn { .. } => {}
    }
}

async fn pull_image(docker: &Docker, image: &str, target: &str) -> Result<(), ExecError> {
    debug!(image, "pulling missing image");
    let mut stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(item) = stream.next().await {
        item.map_err(|e| docker_error(target, e))?;
    }
    Ok(())
}

/// Parse `host:container[/proto]` and bare `container[/proto]` port specs.
#[allow(clippy::type_complexity)]
fn port_maps(
    specs: &[String],
) -> Result<
    (
        Option<HashMap<String, HashMap<(), ()>>>,
        Option<HashMap<String, Option<Vec<PortBinding>>>>,
    ),
    ExecError,
> {
    if specs.is_empty() {
        return Ok((None, None));
    }

    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();

    for raw in specs {
        let (ports, proto) = match raw.split_once('/') {
            Some((ports, proto)) => (ports, proto),
            None => (raw.as_str(), "tcp"),
        };
        let (host_port, container_port) = match ports.split_once(':') {
            Some((host, container)) => (Some(host), container),
            None => (None, ports),
        };
        container_port
            .parse::<u16>()
            .map_err(|_| ExecError::InvalidSpec {
                message: format!("invalid port spec `{}`", raw),
            })?;
        if let Some(host) = host_port {
            host.parse::<u16>().map_err(|_| ExecError::InvalidSpec {
                message: format!("invalid port spec `{}`", raw),
            })?;
        }

        let key = format!("{}/{}", container_port, proto);
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: host_port.map(str::to_string),
            }]),
        );
    }

    Ok((Some(exposed), Some(bindings)))
}

/// Signal delivery through the engine API: `POST /containers/{id}/kill`.
struct DockerControl {
    docker: Docker,
    container: String,
}

#[async_trait]
impl ProcessControl for DockerControl {
    async fn signal(&self, signal: &str) -> Result<(), ExecError> {
        let name = format!("SIG{}", normalize_signal(signal));
        match self
            .docker
            .kill_container(
                &self.container,
                Some(KillContainerOptions { signal: name.as_str() }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Gone or already stopped: the run is ending anyway.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(docker_error(&format!("docker://{}", self.container), e)),
        }
    }

    async fn kill(&self) -> Result<(), ExecError> {
        self.signal("KILL").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Command, ShellSelection};

    #[test]
    fn test_effective_mode() {
        assert_eq!(
            effective_mode(&DockerConfig::container("web")),
            DockerMode::Exec
        );
        assert_eq!(
            effective_mode(&DockerConfig::image("alpine:3")),
            DockerMode::Ephemeral
        );
    }

    #[test]
    fn test_argv_and_env_native_mapping() {
        let mut spec = RunSpec {
            command: Command::Shell {
                script: "cat /etc/hostname".to_string(),
                shell: ShellSelection::Auto,
            },
            ..RunSpec::default()
        };
        spec.env = vec![("FOO".to_string(), "bar".to_string())];
        spec.cwd = Some("/srv".into());

        let cfg = DockerConfig::container("web");
        let (argv, env, cwd) = argv_and_env(&spec, &cfg);
        assert_eq!(argv, vec!["/bin/sh", "-c", "cat /etc/hostname"]);
        assert_eq!(env.unwrap(), vec!["FOO=bar"]);
        assert_eq!(cwd.as_deref(), Some("/srv"));
    }

    #[test]
    fn test_argv_and_env_replace_all_wraps() {
        let mut spec = RunSpec {
            command: Command::Exec {
                argv: vec!["id".to_string()],
            },
            ..RunSpec::default()
        };
        spec.env = vec![("A".to_string(), "1".to_string())];
        spec.env_mode = EnvMode::ReplaceAll;

        let cfg = DockerConfig::container("web");
        let (argv, env, _) = argv_and_env(&spec, &cfg);
        assert_eq!(argv, vec!["env", "-i", "A=1", "id"]);
        assert!(env.is_none());
    }

    #[test]
    fn test_port_maps() {
        let (exposed, bindings) =
            port_maps(&["8080:80".to_string(), "9000/udp".to_string()]).unwrap();
        let exposed = exposed.unwrap();
        let bindings = bindings.unwrap();

        assert!(exposed.contains_key("80/tcp"));
        assert!(exposed.contains_key("9000/udp"));
        let web = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(web[0].host_port.as_deref(), Some("8080"));
        let udp = bindings["9000/udp"].as_ref().unwrap();
        assert_eq!(udp[0].host_port, None);

        assert!(port_maps(&["nope:80x".to_string()]).is_err());
        let (none_a, none_b) = port_maps(&[]).unwrap();
        assert!(none_a.is_none() && none_b.is_none());
    }

    #[tokio::test]
    async fn test_tty_with_stderr_sink_rejected_before_dialing() {
        use crate::pool::{ConnectionFactory, ConnectionPool, PooledConnection};

        struct NeverDial;

        #[async_trait]
        impl ConnectionFactory for NeverDial {
            async fn connect(&self, target: &Target) -> Result<PooledConnection, ExecError> {
                panic!("dialed {} before validating the spec", target.describe());
            }
        }

        let adapter = DockerAdapter::new(ConnectionPool::new(
            crate::pool::PoolConfig::default(),
            Arc::new(NeverDial),
        ));
        let mut cfg = DockerConfig::container("web");
        cfg.tty = true;
        let target = Target::Docker(cfg);

        let (_reader, writer) = tokio::io::duplex(64);
        let mut spec = RunSpec {
            command: Command::Exec {
                argv: vec!["true".to_string()],
            },
            ..RunSpec::default()
        };
        spec.stderr = OutputRouting::Sink(Arc::new(tokio::sync::Mutex::new(writer)));

        let err = adapter.execute(&target, &mut spec).await.unwrap_err();
        assert!(matches!(err, ExecError::InvalidSpec { .. }));
    }
}
