//! Docker daemon connections
//!
//! Resolves a daemon URL (`unix://`, `tcp://`, `http(s)://`, `ssh://`)
//! into a bollard client. The `ssh://` scheme bridges the remote daemon's
//! socket through an SSH session running `docker system dial-stdio`, the
//! same mechanism the docker CLI uses, behind a loopback listener the
//! HTTP client dials.

use std::sync::Arc;

use bollard::{Docker, API_DEFAULT_VERSION};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::adapters::ssh::SshSession;
use crate::core::{DockerConfig, SshConfig};
use crate::error::ExecError;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// A pooled Docker client, optionally keeping an SSH bridge alive.
#[derive(Clone)]
pub struct DockerConnection {
    client: Docker,
    _bridge: Option<Arc<SshBridge>>,
}

impl DockerConnection {
    pub fn client(&self) -> &Docker {
        &self.client
    }

    /// Pool health probe: `GET /_ping`.
    pub async fn ping(&self) -> bool {
        self.client.ping().await.is_ok()
    }
}

/// Build a client for the target's daemon URL.
pub(crate) async fn connect_daemon(cfg: &DockerConfig) -> Result<DockerConnection, ExecError> {
    let url = cfg.daemon_url();
    let target = format!("docker daemon {}", url);

    let (client, bridge) = if url.starts_with("unix://") || url.starts_with('/') {
        let path = url.strip_prefix("unix://").unwrap_or(&url);
        let client = Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| ExecError::Connect {
                target: target.clone(),
                message: e.to_string(),
            })?;
        (client, None)
    } else if url.starts_with("ssh://") {
        let bridge = SshBridge::start(&url).await?;
        let local_url = format!("tcp://{}", bridge.local_addr);
        let client = Docker::connect_with_http(&local_url, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| ExecError::Connect {
                target: target.clone(),
                message: e.to_string(),
            })?;
        (client, Some(Arc::new(bridge)))
    } else if let Some(tls) = &cfg.tls {
        let client = Docker::connect_with_ssl(
            &url,
            &tls.key_path,
            &tls.cert_path,
            &tls.ca_path,
            CONNECT_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| ExecError::Connect {
            target: target.clone(),
            message: e.to_string(),
        })?;
        (client, None)
    } else {
        let client = Docker::connect_with_http(&url, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| ExecError::Connect {
                target: target.clone(),
                message: e.to_string(),
            })?;
        (client, None)
    };

    // Surface unreachable daemons at acquire time instead of first use.
    client.ping().await.map_err(|e| ExecError::Connect {
        target,
        message: format!("daemon ping failed: {}", e),
    })?;

    Ok(DockerConnection {
        client,
        _bridge: bridge,
    })
}

/// Loopback listener whose accepted connections are piped into fresh SSH
/// exec channels running `docker system dial-stdio` on the remote host.
struct SshBridge {
    local_addr: std::net::SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
    _session: Arc<SshSession>,
}

impl SshBridge {
    async fn start(url: &str) -> Result<SshBridge, ExecError> {
        let ssh_cfg = ssh_config_from_url(url)?;
        let session = SshSession::connect(&ssh_cfg).await?;

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| ExecError::Connect {
                target: url.to_string(),
                message: format!("bridge listener bind failed: {}", e),
            })?;
        let local_addr = listener.local_addr().map_err(|e| ExecError::Connect {
            target: url.to_string(),
            message: e.to_string(),
        })?;

        let accept_session = session.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (mut tcp, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("docker ssh bridge accept failed: {}", e);
                        break;
                    }
                };
                let session = accept_session.clone();
                tokio::spawn(async move {
                    let mut channel = match session.open_channel().await {
                        Ok(c) => c,
                        Err(e) => {
                            warn!("docker ssh bridge channel failed: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = channel.exec(true, "docker system dial-stdio").await {
                        warn!("docker dial-stdio exec failed: {}", e);
                        return;
                    }
                    let mut stream = channel.into_stream();
                    if let Err(e) = tokio::io::copy_bidirectional(&mut tcp, &mut stream).await {
                        debug!("docker ssh bridge stream ended: {}", e);
                    }
                });
            }
        });

        debug!(%local_addr, "docker ssh bridge listening");
        Ok(SshBridge {
            local_addr,
            accept_task,
            _session: session,
        })
    }
}

impl Drop for SshBridge {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// `ssh://user@host[:port]` into an agent-authenticated SSH config.
fn ssh_config_from_url(raw: &str) -> Result<SshConfig, ExecError> {
    let parsed = url::Url::parse(raw).map_err(|e| ExecError::Connect {
        target: raw.to_string(),
        message: format!("invalid ssh daemon url: {}", e),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ExecError::Connect {
            target: raw.to_string(),
            message: "ssh daemon url missing a host".to_string(),
        })?
        .to_string();
    let user = if parsed.username().is_empty() {
        std::env::var("USER").unwrap_or_else(|_| "root".to_string())
    } else {
        parsed.username().to_string()
    };

    let mut cfg = SshConfig::new(host, user);
    if let Some(port) = parsed.port() {
        cfg.port = port;
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_config_from_url() {
        let cfg = ssh_config_from_url("ssh://deploy@build-host:2222").unwrap();
        assert_eq!(cfg.host, "build-host");
        assert_eq!(cfg.port, 2222);
        assert_eq!(cfg.user, "deploy");

        let default_port = ssh_config_from_url("ssh://deploy@host").unwrap();
        assert_eq!(default_port.port, 22);
    }

    #[test]
    fn test_ssh_config_from_url_rejects_garbage() {
        assert!(ssh_config_from_url("ssh://").is_err());
        assert!(ssh_config_from_url("not a url at all\u{0}").is_err());
    }
}
