//! Target identity and per-target configuration
//!
//! A [`Target`] names the destination of a run and carries the typed
//! configuration the engine consumes. Config structs reject unknown keys;
//! the engine never sees raw YAML/JSON; an external loader produces these
//! values.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::Deserialize;

/// Ordered environment overlay. Insertion order is preserved so later
/// entries win when a key repeats.
pub type EnvMap = Vec<(String, String)>;

/// Destination of a run.
#[derive(Debug, Clone)]
pub enum Target {
    Local(LocalConfig),
    Ssh(SshConfig),
    Docker(DockerConfig),
    Kubernetes(K8sConfig),
}

/// Target family, used for adapter routing and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Local,
    Ssh,
    Docker,
    Kubernetes,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Local => write!(f, "local"),
            TargetKind::Ssh => write!(f, "ssh"),
            TargetKind::Docker => write!(f, "docker"),
            TargetKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

impl Target {
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Local(_) => TargetKind::Local,
            Target::Ssh(_) => TargetKind::Ssh,
            Target::Docker(_) => TargetKind::Docker,
            Target::Kubernetes(_) => TargetKind::Kubernetes,
        }
    }

    /// Key the connection pool caches under. Targets that resolve to the
    /// same transport share a key: host/port/user (plus jump chain) for
    /// SSH, the daemon URL for Docker, context+namespace for Kubernetes.
    pub fn pool_key(&self) -> String {
        match self {
            Target::Local(_) => "local".to_string(),
            Target::Ssh(cfg) => cfg.pool_key(),
            Target::Docker(cfg) => format!("docker:{}", cfg.daemon_url()),
            Target::Kubernetes(cfg) => format!(
                "k8s:{}:{}",
                cfg.context.as_deref().unwrap_or("current"),
                cfg.namespace
            ),
        }
    }

    /// Human-readable target description used in results, events and errors.
    pub fn describe(&self) -> String {
        match self {
            Target::Local(_) => "local".to_string(),
            Target::Ssh(cfg) => format!("ssh://{}@{}:{}", cfg.user, cfg.host, cfg.port),
            Target::Docker(cfg) => match (&cfg.container, &cfg.image) {
                (Some(c), _) => format!("docker://{}", c),
                (None, Some(i)) => format!("docker+image://{}", i),
                (None, None) => "docker://".to_string(),
            },
            Target::Kubernetes(cfg) => match &cfg.container {
                Some(c) => format!("k8s://{}/{}/{}", cfg.namespace, cfg.pod, c),
                None => format!("k8s://{}/{}", cfg.namespace, cfg.pod),
            },
        }
    }
}

// ============================================================================
// Local
// ============================================================================

/// Local host target configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LocalConfig {
    /// Shell program for shell-mode commands (default: `/bin/sh`)
    #[serde(default)]
    pub shell: Option<String>,

    /// Interpreter preferred when the shell is left on auto
    #[serde(default)]
    pub preferred_runtime: Option<String>,

    /// Run the child under this user id (unix only)
    #[serde(default)]
    pub uid: Option<u32>,

    /// Run the child under this group id (unix only)
    #[serde(default)]
    pub gid: Option<u32>,

    /// Signal sent on timeout/cancel before escalation (default TERM)
    #[serde(default)]
    pub kill_signal: Option<String>,

    /// Default wall-clock budget in milliseconds (0 = none)
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,

    /// Text encoding applied to captured output
    #[serde(default)]
    pub encoding: Option<String>,

    /// Capture cap in bytes
    #[serde(default)]
    pub max_buffer: Option<usize>,
}

// ============================================================================
// SSH
// ============================================================================

/// SSH target configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Intermediate hosts chained with direct-tcpip before the target
    #[serde(default)]
    pub jump_hosts: Vec<SshConfig>,

    #[serde(default = "default_true")]
    pub strict_host_key: bool,

    /// OpenSSH-format known_hosts file (default: `~/.ssh/known_hosts`)
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,

    /// SHA-256 host key fingerprint pin; checked before known_hosts
    #[serde(default)]
    pub host_fingerprint: Option<String>,

    #[serde(default)]
    pub algorithms: AlgorithmConfig,

    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    #[serde(default)]
    pub keep_alive: KeepAliveConfig,

    #[serde(default)]
    pub compression: bool,

    #[serde(default)]
    pub sudo: Option<SudoConfig>,

    #[serde(default)]
    pub env: EnvMap,

    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl SshConfig {
    /// Minimal config for `user@host`.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
            auth: AuthConfig::default(),
            jump_hosts: Vec::new(),
            strict_host_key: true,
            known_hosts_path: None,
            host_fingerprint: None,
            algorithms: AlgorithmConfig::default(),
            ready_timeout_ms: default_ready_timeout_ms(),
            keep_alive: KeepAliveConfig::default(),
            compression: false,
            sudo: None,
            env: Vec::new(),
            cwd: None,
        }
    }

    pub(crate) fn pool_key(&self) -> String {
        let mut key = format!("ssh:{}:{}:{}", self.host, self.port, self.user);
        if !self.jump_hosts.is_empty() {
            // A shared jump chain must share the cached transport.
            let mut hasher = DefaultHasher::new();
            for jump in &self.jump_hosts {
                jump.host.hash(&mut hasher);
                jump.port.hash(&mut hasher);
                jump.user.hash(&mut hasher);
            }
            key.push_str(&format!(":via-{:016x}", hasher.finish()));
        }
        key
    }
}

/// Authentication material and the order methods are attempted in
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AuthConfig {
    /// Use the agent at `SSH_AUTH_SOCK`
    #[serde(default = "default_true")]
    pub agent: bool,

    #[serde(default)]
    pub private_key: Option<PrivateKeyAuth>,

    #[serde(default)]
    pub password: Option<String>,

    /// First method to succeed wins; defaults to agent, key, password
    #[serde(default = "default_auth_order")]
    pub order: Vec<AuthMethod>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            agent: true,
            private_key: None,
            password: None,
            order: default_auth_order(),
        }
    }
}

// Secrets never reach logs through Debug.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("agent", &self.agent)
            .field("private_key", &self.private_key)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("order", &self.order)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Agent,
    PrivateKey,
    Password,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Agent => write!(f, "agent"),
            AuthMethod::PrivateKey => write!(f, "private-key"),
            AuthMethod::Password => write!(f, "password"),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PrivateKeyAuth {
    pub path: PathBuf,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for PrivateKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyAuth")
            .field("path", &self.path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Preferred algorithm names, most preferred first. Empty lists keep the
/// client library's defaults (curve25519/ed25519/aes-gcm first).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AlgorithmConfig {
    #[serde(default)]
    pub kex: Vec<String>,
    #[serde(default)]
    pub cipher: Vec<String>,
    #[serde(default)]
    pub mac: Vec<String>,
    #[serde(default)]
    pub host_key: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct KeepAliveConfig {
    #[serde(default = "default_keepalive_interval_ms")]
    pub interval_ms: u64,

    /// Unanswered keep-alives before the transport is marked failed
    #[serde(default = "default_keepalive_count_max")]
    pub count_max: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_keepalive_interval_ms(),
            count_max: default_keepalive_count_max(),
        }
    }
}

/// How a sudo password reaches the remote host
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SudoConfig {
    #[serde(default)]
    pub method: SudoMethod,

    #[serde(default)]
    pub password: Option<String>,

    /// Prompt override for `sudo -p`
    #[serde(default)]
    pub prompt: Option<String>,
}

impl std::fmt::Debug for SudoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SudoConfig")
            .field("method", &self.method)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("prompt", &self.prompt)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SudoMethod {
    /// Upload a one-shot askpass script (0700), run `sudo -A`, unlink it
    #[default]
    SecureAskpass,
    /// Password in a 0600 temp file consumed by `sudo -S`
    Secure,
    /// Use the `SUDO_ASKPASS` already installed on the server
    Askpass,
    /// `sudo -S -p ''` with the password written to the channel
    Stdin,
    /// Deprecated alias of `stdin`
    Echo,
}

// ============================================================================
// Docker
// ============================================================================

/// Docker target configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DockerConfig {
    /// Exec in an existing container or run an ephemeral one
    #[serde(default)]
    pub mode: DockerMode,

    /// Existing container name or id (exec mode)
    #[serde(default)]
    pub container: Option<String>,

    /// Image for ephemeral runs
    #[serde(default)]
    pub image: Option<String>,

    /// Daemon URL: `unix://`, `tcp://`, `http(s)://`, or `ssh://`.
    /// Falls back to `DOCKER_HOST`, then the platform default socket.
    #[serde(default)]
    pub daemon: Option<String>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Host:container port publications, ephemeral runs only
    #[serde(default)]
    pub ports: Vec<String>,

    /// Host bind mounts (`/host:/container[:ro]`), ephemeral runs only
    #[serde(default)]
    pub binds: Vec<String>,

    #[serde(default)]
    pub env: EnvMap,

    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub auto_remove: bool,

    #[serde(default)]
    pub tty: bool,
}

impl DockerConfig {
    /// Exec-mode config against an existing container.
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            mode: DockerMode::Exec,
            container: Some(name.into()),
            ..Self::empty()
        }
    }

    /// Ephemeral-mode config for an image.
    pub fn image(image: impl Into<String>) -> Self {
        Self {
            mode: DockerMode::Ephemeral,
            image: Some(image.into()),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            mode: DockerMode::default(),
            container: None,
            image: None,
            daemon: None,
            tls: None,
            ports: Vec::new(),
            binds: Vec::new(),
            env: Vec::new(),
            cwd: None,
            auto_remove: true,
            tty: false,
        }
    }

    /// The daemon URL this target resolves to, observing `DOCKER_HOST`.
    pub fn daemon_url(&self) -> String {
        self.daemon
            .clone()
            .or_else(|| std::env::var("DOCKER_HOST").ok())
            .unwrap_or_else(|| "unix:///var/run/docker.sock".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DockerMode {
    #[default]
    Exec,
    Ephemeral,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TlsConfig {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

// ============================================================================
// Kubernetes
// ============================================================================

/// Kubernetes target configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct K8sConfig {
    /// Explicit kubeconfig path; `KUBECONFIG` or the default location otherwise
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default)]
    pub context: Option<String>,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    pub pod: String,

    #[serde(default)]
    pub container: Option<String>,

    /// Shell used for shell-mode commands inside the pod
    #[serde(default = "default_k8s_shell")]
    pub shell: String,

    #[serde(default)]
    pub env: EnvMap,

    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl K8sConfig {
    pub fn pod(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            kubeconfig: None,
            context: None,
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
            shell: default_k8s_shell(),
            env: Vec::new(),
            cwd: None,
        }
    }
}

// ============================================================================
// serde defaults
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ready_timeout_ms() -> u64 {
    20_000
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

fn default_keepalive_count_max() -> u32 {
    3
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_k8s_shell() -> String {
    "sh".to_string()
}

fn default_auth_order() -> Vec<AuthMethod> {
    vec![AuthMethod::Agent, AuthMethod::PrivateKey, AuthMethod::Password]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_keys_distinguish_targets() {
        let a = Target::Ssh(SshConfig::new("web1", "deploy"));
        let b = Target::Ssh(SshConfig::new("web2", "deploy"));
        let c = Target::Local(LocalConfig::default());
        assert_ne!(a.pool_key(), b.pool_key());
        assert_eq!(c.pool_key(), "local");
    }

    #[test]
    fn test_ssh_pool_key_includes_jump_chain() {
        let plain = SshConfig::new("db1", "root");
        let mut jumped = SshConfig::new("db1", "root");
        jumped.jump_hosts.push(SshConfig::new("bastion", "root"));
        assert_ne!(plain.pool_key(), jumped.pool_key());

        let mut jumped2 = SshConfig::new("db1", "root");
        jumped2.jump_hosts.push(SshConfig::new("bastion", "root"));
        assert_eq!(jumped.pool_key(), jumped2.pool_key());
    }

    #[test]
    fn test_docker_daemon_url_default() {
        let cfg = DockerConfig::container("app");
        if std::env::var("DOCKER_HOST").is_err() {
            assert_eq!(cfg.daemon_url(), "unix:///var/run/docker.sock");
        }
        let mut tcp = DockerConfig::container("app");
        tcp.daemon = Some("tcp://10.0.0.5:2375".to_string());
        assert_eq!(tcp.daemon_url(), "tcp://10.0.0.5:2375");
    }

    #[test]
    fn test_config_rejects_unknown_keys() {
        let err = serde_json::from_str::<K8sConfig>(
            r#"{"namespace":"prod","pod":"api-0","flavor":"spicy"}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_ssh_config_deserializes_with_defaults() {
        let cfg: SshConfig =
            serde_json::from_str(r#"{"host":"web1","user":"deploy"}"#).unwrap();
        assert_eq!(cfg.port, 22);
        assert!(cfg.strict_host_key);
        assert_eq!(cfg.keep_alive.interval_ms, 30_000);
        assert_eq!(cfg.keep_alive.count_max, 3);
        assert_eq!(
            cfg.auth.order,
            vec![AuthMethod::Agent, AuthMethod::PrivateKey, AuthMethod::Password]
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut cfg = SshConfig::new("web1", "deploy");
        cfg.auth.password = Some("hunter2".to_string());
        cfg.auth.private_key = Some(PrivateKeyAuth {
            path: "/keys/id_ed25519".into(),
            passphrase: Some("keypass".to_string()),
        });
        cfg.sudo = Some(SudoConfig {
            method: SudoMethod::SecureAskpass,
            password: Some("sudopw".to_string()),
            prompt: None,
        });

        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("keypass"));
        assert!(!printed.contains("sudopw"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn test_describe() {
        let t = Target::Ssh(SshConfig::new("web1", "deploy"));
        assert_eq!(t.describe(), "ssh://deploy@web1:22");
        let k = Target::Kubernetes(K8sConfig::pod("prod", "api-0"));
        assert_eq!(k.describe(), "k8s://prod/api-0");
    }
}
