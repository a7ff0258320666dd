//! Engine façade
//!
//! Owns the pool, the event bus, and one adapter per target family.
//! Target-scoped engines (`engine.ssh(cfg)`, `engine.docker(cfg)`,
//! `engine.k8s(cfg)`) are cheap clones sharing the same pool and bus;
//! `with()` layers scoped defaults, right-hand side winning.

mod builder;
pub mod parallel;
mod run;

pub use builder::{CommandBuilder, RetryPolicy};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::adapters::docker::{connect_daemon, DockerAdapter};
use crate::adapters::k8s::{connect_k8s, KubernetesAdapter};
use crate::adapters::local::LocalAdapter;
use crate::adapters::ssh::{SshAdapter, SshSession};
use crate::adapters::Adapter;
use crate::core::{
    DockerConfig, Encoding, EnvMap, EnvMode, K8sConfig, LocalConfig, ShellSelection, SshConfig,
    Target,
};
use crate::error::ExecError;
use crate::events::EventBus;
use crate::pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolMetrics, PooledConnection};

/// Engine construction options.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub pool: PoolConfig,
    pub defaults: Defaults,
}

impl From<PoolConfig> for EngineOptions {
    fn from(pool: PoolConfig) -> Self {
        Self {
            pool,
            defaults: Defaults::default(),
        }
    }
}

/// Scoped run defaults, composable with `Engine::with`. Every field is an
/// overlay: `None` keeps whatever the lower layer says.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    pub timeout: Option<Duration>,
    pub env: EnvMap,
    pub env_mode: Option<EnvMode>,
    pub cwd: Option<PathBuf>,
    pub shell: Option<ShellSelection>,
    pub quiet: Option<bool>,
    pub max_buffer: Option<usize>,
    pub kill_signal: Option<String>,
    pub grace_period: Option<Duration>,
    pub throw_on_non_zero: Option<bool>,
    pub encoding: Option<Encoding>,
}

impl Defaults {
    /// Overlay `other` on `self`; the right-hand side wins, env entries
    /// concatenate (later entries win at spec assembly).
    pub fn compose(&self, other: &Defaults) -> Defaults {
        let mut env = self.env.clone();
        env.extend(other.env.iter().cloned());
        Defaults {
            timeout: other.timeout.or(self.timeout),
            env,
            env_mode: other.env_mode.or(self.env_mode),
            cwd: other.cwd.clone().or_else(|| self.cwd.clone()),
            shell: other.shell.clone().or_else(|| self.shell.clone()),
            quiet: other.quiet.or(self.quiet),
            max_buffer: other.max_buffer.or(self.max_buffer),
            kill_signal: other.kill_signal.clone().or_else(|| self.kill_signal.clone()),
            grace_period: other.grace_period.or(self.grace_period),
            throw_on_non_zero: other.throw_on_non_zero.or(self.throw_on_non_zero),
            encoding: other.encoding.or(self.encoding),
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) pool: ConnectionPool,
    pub(crate) events: EventBus,
    local: LocalAdapter,
    ssh: SshAdapter,
    docker: DockerAdapter,
    k8s: KubernetesAdapter,
}

impl EngineInner {
    pub(crate) fn adapter_for(&self, target: &Target) -> &dyn Adapter {
        match target {
            Target::Local(_) => &self.local,
            Target::Ssh(_) => &self.ssh,
            Target::Docker(_) => &self.docker,
            Target::Kubernetes(_) => &self.k8s,
        }
    }
}

/// Dials transports for the pool, dispatching on target family. Local
/// targets never pool.
struct EngineConnectionFactory;

#[async_trait]
impl ConnectionFactory for EngineConnectionFactory {
    async fn connect(&self, target: &Target) -> Result<PooledConnection, ExecError> {
        match target {
            Target::Ssh(cfg) => Ok(PooledConnection::Ssh(SshSession::connect(cfg).await?)),
            Target::Docker(cfg) => Ok(PooledConnection::Docker(connect_daemon(cfg).await?)),
            Target::Kubernetes(cfg) => Ok(PooledConnection::Kubernetes(connect_k8s(cfg).await?)),
            Target::Local(_) => Err(ExecError::InvalidSpec {
                message: "local targets do not use pooled connections".to_string(),
            }),
        }
    }
}

/// Top-level façade: the single programmatic surface for running commands
/// against any target family.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
    target: Target,
    defaults: Defaults,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        let pool = ConnectionPool::new(options.pool, Arc::new(EngineConnectionFactory));
        let inner = Arc::new(EngineInner {
            events: EventBus::new(),
            local: LocalAdapter::new(),
            ssh: SshAdapter::new(pool.clone()),
            docker: DockerAdapter::new(pool.clone()),
            k8s: KubernetesAdapter::new(pool.clone()),
            pool,
        });
        Self {
            inner,
            target: Target::Local(LocalConfig::default()),
            defaults: options.defaults,
        }
    }

    // -- target scoping ------------------------------------------------------

    /// Scope to the local host.
    pub fn local(&self) -> Engine {
        self.retarget(Target::Local(LocalConfig::default()))
    }

    /// Scope to the local host with explicit options.
    pub fn local_with(&self, cfg: LocalConfig) -> Engine {
        self.retarget(Target::Local(cfg))
    }

    /// Scope to an SSH host.
    pub fn ssh(&self, cfg: SshConfig) -> Engine {
        self.retarget(Target::Ssh(cfg))
    }

    /// Scope to a Docker container or image.
    pub fn docker(&self, cfg: DockerConfig) -> Engine {
        self.retarget(Target::Docker(cfg))
    }

    /// Scope to a Kubernetes pod.
    pub fn k8s(&self, cfg: K8sConfig) -> Engine {
        self.retarget(Target::Kubernetes(cfg))
    }

    /// Scope to an explicit target value.
    pub fn target(&self, target: Target) -> Engine {
        self.retarget(target)
    }

    fn retarget(&self, target: Target) -> Engine {
        Engine {
            inner: self.inner.clone(),
            target,
            defaults: self.defaults.clone(),
        }
    }

    /// A new façade with `defaults` layered on; the new values win.
    pub fn with(&self, defaults: Defaults) -> Engine {
        Engine {
            inner: self.inner.clone(),
            target: self.target.clone(),
            defaults: self.defaults.compose(&defaults),
        }
    }

    // -- builders ------------------------------------------------------------

    /// Start a shell-mode command. `{}` placeholders are filled by
    /// [`CommandBuilder::arg`]/[`CommandBuilder::args`] through the quoter.
    pub fn shell(&self, script: impl Into<String>) -> CommandBuilder {
        CommandBuilder::from_shell(self.clone(), script.into())
    }

    /// Start an argv-mode command; no shell is involved anywhere.
    pub fn exec<I, S>(&self, argv: I) -> CommandBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandBuilder::from_exec(self.clone(), argv.into_iter().map(Into::into).collect())
    }

    // -- observation and lifecycle -------------------------------------------

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn pool_metrics(&self) -> PoolMetrics {
        self.inner.pool.metrics()
    }

    /// Drain the pool and refuse further pooled runs.
    pub async fn shutdown(&self, grace: Duration) {
        info!("engine shutting down");
        self.inner.pool.drain(grace).await;
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    pub(crate) fn current_target(&self) -> &Target {
        &self.target
    }

    pub(crate) fn current_defaults(&self) -> &Defaults {
        &self.defaults
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

pub(crate) use run::dispatch;
