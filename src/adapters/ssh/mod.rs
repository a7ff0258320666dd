//! SSH adapter
//!
//! Runs commands over pooled SSH transports. Every run opens a fresh exec
//! channel; the command string is assembled from the spec (env prefix,
//! `cd` wrapping, POSIX-quoted argv) because SSH servers commonly refuse
//! `SendEnv`. Sudo wrapping and password delivery live in [`sudo`].

mod connection;
mod sudo;

pub use connection::SshSession;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use self::sudo::{build_sudo_plan, SudoPlan, SudoUpload};
use super::{
    normalize_signal, signal_number, spawn_stdin_feed, Adapter, ExitStatus, ProcessControl,
    RunHandle, CHUNK_CHANNEL_CAPACITY,
};
use crate::core::quote::{self, ShellProfile};
use crate::core::{Command, EnvMode, RunSpec, ShellSelection, StdinSource, Target, TargetKind};
use crate::error::ExecError;
use crate::pool::ConnectionPool;

pub struct SshAdapter {
    pool: ConnectionPool,
}

impl SshAdapter {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }
}

/// Everything needed to exec one command string over a channel.
struct Prepared {
    command: String,
    stdin_prelude: Option<Bytes>,
    upload: Option<SudoUpload>,
    cleanup: Option<String>,
}

/// Assemble the final command string: sudo wrapping first, then the env
/// prefix, then `cd`, outermost.
fn prepare(spec: &RunSpec) -> Result<Prepared, ExecError> {
    let base = match &spec.command {
        Command::Shell { script, shell } => match shell {
            ShellSelection::Auto => script.clone(),
            ShellSelection::Named(name) => format!(
                "{} -c {}",
                name,
                quote::quote(ShellProfile::Posix, script)
            ),
        },
        Command::Exec { argv } => quote::join(ShellProfile::Posix, argv),
    };

    let plan = match &spec.sudo {
        Some(sudo) => build_sudo_plan(&base, sudo)?,
        None => SudoPlan {
            command: base,
            ..SudoPlan::default()
        },
    };

    let mut command = plan.command;

    if !spec.env.is_empty() || matches!(spec.env_mode, EnvMode::ReplaceAll) {
        let prefix = match spec.env_mode {
            // The remote environment belongs to the server; only the overlay
            // travels. A full replacement goes through `env -i`.
            EnvMode::ReplaceAll => {
                let mut p = String::from("env -i ");
                p.push_str(&quote::env_prefix(&spec.env));
                p
            }
            _ => quote::env_prefix(&spec.env),
        };
        command = format!("{}{}", prefix, command);
    }

    if let Some(cwd) = &spec.cwd {
        command = format!(
            "cd {} && {}",
            quote::quote(ShellProfile::Posix, &cwd.to_string_lossy()),
            command
        );
    }

    Ok(Prepared {
        command,
        stdin_prelude: plan.stdin_prelude,
        upload: plan.upload,
        cleanup: plan.cleanup,
    })
}

/// Push a payload to the remote filesystem through a setup command's
/// stdin, so secret material never crosses an argv.
async fn run_upload(session: &SshSession, upload: &SudoUpload) -> Result<(), ExecError> {
    let mut channel = session.open_channel().await?;
    channel
        .exec(true, upload.command.as_str())
        .await
        .map_err(|e| ExecError::Protocol {
            target: session.description().to_string(),
            message: format!("upload exec failed: {}", e),
        })?;

    let mut writer = channel.make_writer();
    writer
        .write_all(&upload.payload)
        .await
        .map_err(|e| ExecError::Protocol {
            target: session.description().to_string(),
            message: format!("upload write failed: {}", e),
        })?;
    writer.shutdown().await.ok();

    let mut status = 0u32;
    while let Some(msg) = channel.wait().await {
        if let russh::ChannelMsg::ExitStatus { exit_status } = msg {
            status = exit_status;
        }
    }
    if status != 0 {
        return Err(ExecError::Protocol {
            target: session.description().to_string(),
            message: format!("upload command exited with {}", status),
        });
    }
    Ok(())
}

enum ControlMsg {
    Signal(String),
    Kill,
}

struct SshControl {
    tx: mpsc::Sender<ControlMsg>,
}

#[async_trait]
impl ProcessControl for SshControl {
    async fn signal(&self, signal: &str) -> Result<(), ExecError> {
        self.tx
            .send(ControlMsg::Signal(normalize_signal(signal)))
            .await
            .ok();
        Ok(())
    }

    async fn kill(&self) -> Result<(), ExecError> {
        self.tx.send(ControlMsg::Kill).await.ok();
        Ok(())
    }
}

fn sig_for(name: &str) -> russh::Sig {
    match name {
        "ABRT" => russh::Sig::ABRT,
        "ALRM" => russh::Sig::ALRM,
        "FPE" => russh::Sig::FPE,
        "HUP" => russh::Sig::HUP,
        "ILL" => russh::Sig::ILL,
        "INT" => russh::Sig::INT,
        "KILL" => russh::Sig::KILL,
        "PIPE" => russh::Sig::PIPE,
        "QUIT" => russh::Sig::QUIT,
        "SEGV" => russh::Sig::SEGV,
        "TERM" => russh::Sig::TERM,
        "USR1" => russh::Sig::USR1,
        other => russh::Sig::Custom(other.to_string()),
    }
}

fn sig_name(sig: &russh::Sig) -> String {
    match sig {
        russh::Sig::Custom(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Ssh
    }

    async fn execute(&self, target: &Target, spec: &mut RunSpec) -> Result<RunHandle, ExecError> {
        if !matches!(target, Target::Ssh(_)) {
            return Err(ExecError::InvalidSpec {
                message: format!("ssh adapter handed a {} target", target.kind()),
            });
        }

        let prepared = prepare(spec)?;
        let guard = self.pool.acquire(target).await?;
        let session = guard
            .as_ssh()
            .cloned()
            .ok_or_else(|| ExecError::Protocol {
                target: target.describe(),
                message: "pool returned a non-ssh connection".to_string(),
            })?;

        if let Some(upload) = &prepared.upload {
            run_upload(&session, upload).await?;
        }

        let mut channel = session.open_channel().await?;
        channel
            .exec(true, prepared.command.as_str())
            .await
            .map_err(|e| ExecError::Protocol {
                target: session.description().to_string(),
                message: format!("exec request failed: {}", e),
            })?;
        debug!(target = %session.description(), command = %spec.render_command(), "ssh exec started");

        // Stdin runs through the channel writer; a sudo prelude goes first.
        let stdin_source = std::mem::replace(&mut spec.stdin, StdinSource::Null);
        let writer = channel.make_writer();
        spawn_stdin_feed(writer, prepared.stdin_prelude.clone(), stdin_source);

        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (control_tx, mut control_rx) = mpsc::channel::<ControlMsg>(8);

        let cleanup = prepared.cleanup.clone();
        let pump_session = session.clone();
        tokio::spawn(async move {
            // The guard rides along so the borrow is released exactly when
            // the run is finished, cleanup included.
            let _guard = guard;
            let mut exit_code: Option<i32> = None;
            let mut exit_signal: Option<(String, i32)> = None;

            loop {
                tokio::select! {
                    msg = channel.wait() => {
                        match msg {
                            Some(russh::ChannelMsg::Data { ref data }) => {
                                // A gone consumer is fine; keep draining for exit.
                                let _ = stdout_tx.send(Bytes::copy_from_slice(data)).await;
                            }
                            Some(russh::ChannelMsg::ExtendedData { ref data, ext }) => {
                                if ext == 1 {
                                    let _ = stderr_tx.send(Bytes::copy_from_slice(data)).await;
                                }
                            }
                            Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                                exit_code = Some(exit_status as i32);
                            }
                            Some(russh::ChannelMsg::ExitSignal { signal_name, .. }) => {
                                let name = sig_name(&signal_name);
                                let number = signal_number(&name).unwrap_or(15);
                                exit_signal = Some((name, number));
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                    Some(ctl) = control_rx.recv() => {
                        match ctl {
                            ControlMsg::Signal(name) => {
                                if let Err(e) = channel.signal(sig_for(&name)).await {
                                    warn!("ssh signal delivery failed: {}", e);
                                }
                            }
                            ControlMsg::Kill => {
                                let _ = channel.signal(russh::Sig::KILL).await;
                                let _ = channel.eof().await;
                                let _ = channel.close().await;
                            }
                        }
                    }
                }
            }

            drop(stdout_tx);
            drop(stderr_tx);

            if let Some(cleanup) = cleanup {
                pump_session.exec_quiet(&cleanup).await;
            }

            // Exit-status wins; a reported signal maps to 128+n; a channel
            // that closed with neither yields the undetermined marker.
            let status = match (exit_code, exit_signal) {
                (Some(code), signal) => ExitStatus {
                    code,
                    signal: signal.map(|(name, _)| name),
                },
                (None, Some((name, number))) => ExitStatus::signalled(name, number),
                (None, None) => ExitStatus::clean(-1),
            };
            let _ = exit_tx.send(Ok(status));
        });

        let control = Arc::new(SshControl { tx: control_tx });
        let mut handle = RunHandle::new(None, Some(stdout_rx), Some(stderr_rx), exit_rx, control);
        handle.set_target_label(format!(
            "{} (auth: {})",
            session.description(),
            session.auth_method()
        ));
        Ok(handle)
    }
}
