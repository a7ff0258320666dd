//! SSH transport: connect, verify, authenticate
//!
//! One [`SshSession`] wraps one authenticated russh transport and
//! multiplexes exec channels over it. Jump hosts are chained with
//! direct-tcpip; keep-alives are handled by the client config and an
//! unanswered-count limit.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::agent::client::AgentClient;
use russh::keys::{load_secret_key, ssh_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::{AuthMethod, SshConfig};
use crate::error::ExecError;

/// Host key verification policy carried into the russh handler.
#[derive(Clone)]
struct HostVerification {
    host: String,
    port: u16,
    strict: bool,
    known_hosts_path: Option<std::path::PathBuf>,
    fingerprint: Option<String>,
}

struct ClientHandler {
    verify: HostVerification,
}

impl client::Handler for ClientHandler {
    type Error = ExecError;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        verify_host_key(&self.verify, server_public_key)
    }
}

fn verify_host_key(
    verify: &HostVerification,
    key: &ssh_key::PublicKey,
) -> Result<bool, ExecError> {
    // A pinned fingerprint takes precedence over known_hosts.
    if let Some(expected) = &verify.fingerprint {
        let actual = key.fingerprint(ssh_key::HashAlg::Sha256).to_string();
        let expected_full = if expected.starts_with("SHA256:") {
            expected.clone()
        } else {
            format!("SHA256:{}", expected)
        };
        if actual == expected_full {
            return Ok(true);
        }
        return Err(ExecError::Connect {
            target: format!("ssh://{}:{}", verify.host, verify.port),
            message: format!(
                "host key fingerprint mismatch: expected {}, got {}",
                expected_full, actual
            ),
        });
    }

    let checked = match &verify.known_hosts_path {
        Some(path) => {
            russh::keys::check_known_hosts_path(&verify.host, verify.port, key, path)
        }
        None => russh::keys::check_known_hosts(&verify.host, verify.port, key),
    };

    match checked {
        Ok(true) => Ok(true),
        Ok(false) => {
            if verify.strict {
                Err(ExecError::Connect {
                    target: format!("ssh://{}:{}", verify.host, verify.port),
                    message: "host key not present in known_hosts (strict checking)".to_string(),
                })
            } else {
                // Trust on first use: append and continue.
                let learned = match &verify.known_hosts_path {
                    Some(path) => russh::keys::known_hosts::learn_known_hosts_path(
                        &verify.host,
                        verify.port,
                        key,
                        path,
                    ),
                    None => russh::keys::known_hosts::learn_known_hosts(&verify.host, verify.port, key),
                };
                if let Err(e) = learned {
                    warn!(host = %verify.host, "failed to record host key: {}", e);
                }
                Ok(true)
            }
        }
        Err(e) => Err(ExecError::Connect {
            target: format!("ssh://{}:{}", verify.host, verify.port),
            message: format!("host key verification failed: {}", e),
        }),
    }
}

/// One authenticated SSH transport, shareable across runs. Channels opened
/// from it are independent; the handle itself is serialized behind a lock.
pub struct SshSession {
    handle: Mutex<client::Handle<ClientHandler>>,
    /// Transports for intermediate jump hosts, kept alive for the chain
    _jumps: Vec<client::Handle<ClientHandler>>,
    auth_method: String,
    description: String,
}

impl SshSession {
    /// Connect and authenticate, chaining jump hosts first.
    pub async fn connect(cfg: &SshConfig) -> Result<Arc<SshSession>, ExecError> {
        let ready_timeout = Duration::from_millis(cfg.ready_timeout_ms.max(1));
        let description = format!("ssh://{}@{}:{}", cfg.user, cfg.host, cfg.port);

        let mut jumps: Vec<client::Handle<ClientHandler>> = Vec::new();

        for jump in &cfg.jump_hosts {
            let mut handle = match jumps.last() {
                None => connect_direct(jump, ready_timeout).await?,
                Some(previous) => connect_via(previous, jump, ready_timeout).await?,
            };
            // Each hop authenticates with its own credentials before the
            // next direct-tcpip tunnel opens through it.
            authenticate(&mut handle, jump).await?;
            jumps.push(handle);
        }

        let (mut handle, _) = match jumps.last() {
            None => (connect_direct(cfg, ready_timeout).await?, ()),
            Some(previous) => (connect_via(previous, cfg, ready_timeout).await?, ()),
        };

        let auth_method = authenticate(&mut handle, cfg).await?;
        info!(target = %description, method = %auth_method, "ssh session established");

        Ok(Arc::new(SshSession {
            handle: Mutex::new(handle),
            _jumps: jumps,
            auth_method,
            description,
        }))
    }

    /// Open a fresh exec channel on the shared transport.
    pub async fn open_channel(
        &self,
    ) -> Result<russh::Channel<client::Msg>, ExecError> {
        let mut handle = self.handle.lock().await;
        handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::Connect {
                target: self.description.clone(),
                message: format!("failed to open channel: {}", e),
            })
    }

    /// Run a short housekeeping command (askpass cleanup and the like),
    /// discarding output. Failures are logged, never surfaced.
    pub(crate) async fn exec_quiet(&self, command: &str) {
        match self.open_channel().await {
            Ok(mut channel) => {
                if let Err(e) = channel.exec(true, command).await {
                    warn!("housekeeping exec failed: {}", e);
                    return;
                }
                while let Some(msg) = channel.wait().await {
                    if matches!(msg, ChannelMsg::Close) {
                        break;
                    }
                }
            }
            Err(e) => warn!("housekeeping channel failed: {}", e),
        }
    }

    /// Which auth method won, for result/target descriptions.
    pub fn auth_method(&self) -> &str {
        &self.auth_method
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Cheap liveness probe used by the pool on borrow.
    pub async fn is_healthy(&self) -> bool {
        let mut handle = self.handle.lock().await;
        let _ = &mut handle;
        !handle.is_closed()
    }

    pub async fn close(&self) {
        let mut handle = self.handle.lock().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await;
        debug!(target = %self.description, "ssh session closed");
    }
}

fn client_config(cfg: &SshConfig) -> Arc<client::Config> {
    Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_millis(cfg.keep_alive.interval_ms.max(1000))),
        keepalive_max: cfg.keep_alive.count_max as usize,
        inactivity_timeout: None,
        ..Default::default()
    })
}

fn handler_for(cfg: &SshConfig) -> ClientHandler {
    ClientHandler {
        verify: HostVerification {
            host: cfg.host.clone(),
            port: cfg.port,
            strict: cfg.strict_host_key,
            known_hosts_path: cfg.known_hosts_path.clone(),
            fingerprint: cfg.host_fingerprint.clone(),
        },
    }
}

async fn connect_direct(
    cfg: &SshConfig,
    ready_timeout: Duration,
) -> Result<client::Handle<ClientHandler>, ExecError> {
    let addr = (cfg.host.as_str(), cfg.port);
    tokio::time::timeout(
        ready_timeout,
        client::connect(client_config(cfg), addr, handler_for(cfg)),
    )
    .await
    .map_err(|_| ExecError::Connect {
        target: format!("ssh://{}:{}", cfg.host, cfg.port),
        message: format!("handshake timed out after {:?}", ready_timeout),
    })?
    .map_err(|e| e.with_context(&format!("ssh://{}:{}", cfg.host, cfg.port), ""))
}

/// Open a direct-tcpip tunnel from an established hop and run the next
/// handshake over it.
async fn connect_via(
    previous: &client::Handle<ClientHandler>,
    cfg: &SshConfig,
    ready_timeout: Duration,
) -> Result<client::Handle<ClientHandler>, ExecError> {
    let channel = previous
        .channel_open_direct_tcpip(cfg.host.clone(), cfg.port as u32, "127.0.0.1", 0)
        .await
        .map_err(|e| ExecError::Connect {
            target: format!("ssh://{}:{}", cfg.host, cfg.port),
            message: format!("direct-tcpip tunnel failed: {}", e),
        })?;

    let stream = channel.into_stream();
    tokio::time::timeout(
        ready_timeout,
        client::connect_stream(client_config(cfg), stream, handler_for(cfg)),
    )
    .await
    .map_err(|_| ExecError::Connect {
        target: format!("ssh://{}:{}", cfg.host, cfg.port),
        message: format!("handshake timed out after {:?}", ready_timeout),
    })?
    .map_err(|e| e.with_context(&format!("ssh://{}:{}", cfg.host, cfg.port), ""))
}

/// Try the configured auth methods in order; first success wins. Returns
/// the label of the winning method.
async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    cfg: &SshConfig,
) -> Result<String, ExecError> {
    let target = format!("ssh://{}@{}:{}", cfg.user, cfg.host, cfg.port);
    let mut attempts: Vec<String> = Vec::new();

    for method in &cfg.auth.order {
        match method {
            AuthMethod::Agent => {
                if !cfg.auth.agent {
                    continue;
                }
                match try_agent_auth(handle, &cfg.user).await {
                    Ok(true) => return Ok("agent".to_string()),
                    Ok(false) => attempts.push("agent (rejected)".to_string()),
                    Err(e) => {
                        debug!("agent auth unavailable: {}", e);
                        attempts.push(format!("agent ({})", e));
                    }
                }
            }
            AuthMethod::PrivateKey => {
                let Some(pk) = &cfg.auth.private_key else { continue };
                let key = load_secret_key(&pk.path, pk.passphrase.as_deref()).map_err(|e| {
                    ExecError::Auth {
                        target: target.clone(),
                        message: format!("cannot load key {}: {}", pk.path.display(), e),
                    }
                })?;
                let best_hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(ExecError::from)?
                    .flatten();
                let result = handle
                    .authenticate_publickey(
                        cfg.user.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), best_hash),
                    )
                    .await
                    .map_err(ExecError::from)?;
                if matches!(result, AuthResult::Success) {
                    return Ok("private-key".to_string());
                }
                attempts.push("private-key (rejected)".to_string());
            }
            AuthMethod::Password => {
                let Some(password) = &cfg.auth.password else { continue };
                let result = handle
                    .authenticate_password(cfg.user.clone(), password.clone())
                    .await
                    .map_err(ExecError::from)?;
                if matches!(result, AuthResult::Success) {
                    return Ok("password".to_string());
                }
                attempts.push("password (rejected)".to_string());
            }
        }
    }

    Err(ExecError::Auth {
        target,
        message: if attempts.is_empty() {
            "no authentication method configured".to_string()
        } else {
            format!("all methods exhausted: {}", attempts.join(", "))
        },
    })
}

/// Offer every identity the agent holds until one is accepted.
async fn try_agent_auth(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
) -> Result<bool, String> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| format!("no agent: {}", e))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("identity listing failed: {}", e))?;

    for key in identities {
        let best_hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| e.to_string())?
            .flatten();
        match handle
            .authenticate_publickey_with(user, key, best_hash, &mut agent)
            .await
        {
            Ok(AuthResult::Success) => return Ok(true),
            Ok(AuthResult::Failure { .. }) => continue,
            Err(e) => {
                debug!("agent signature attempt failed: {}", e);
                continue;
            }
        }
    }
    Ok(false)
}
