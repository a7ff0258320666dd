//! xec-engine: universal command execution
//!
//! One programmatic surface for running shell commands against four
//! target families (the local host, remote hosts over SSH, Docker
//! containers, and Kubernetes pods) with identical semantics for input,
//! output, exit status, streaming, timeouts, cancellation, and errors.
//!
//! ```no_run
//! use std::time::Duration;
//! use xec_engine::{Engine, SshConfig};
//!
//! # async fn demo() -> Result<(), xec_engine::ExecError> {
//! let engine = Engine::default();
//!
//! // Local
//! let hello = engine.shell("echo hello").run().await?;
//! assert_eq!(hello.text(), "hello");
//!
//! // Remote, with a timeout and quoted interpolation
//! let uptime = engine
//!     .ssh(SshConfig::new("web1", "deploy"))
//!     .shell("uptime -p {}")
//!     .arg("ignored arg with spaces")
//!     .timeout(Duration::from_secs(10))
//!     .run()
//!     .await?;
//! println!("{}", uptime.text());
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod pool;

// The common surface, re-exported flat.
pub use self::core::{
    AuthConfig, AuthMethod, Command, DockerConfig, DockerMode, Encoding, EnvMap, EnvMode,
    ExecResult, K8sConfig, KeepAliveConfig, LocalConfig, OutputRouting, PrivateKeyAuth, RunSpec,
    ShellProfile, ShellSelection, SshConfig, StdinSource, SudoConfig, SudoMethod, Target,
    TargetKind, TlsConfig,
};
pub use self::engine::{parallel, CommandBuilder, Defaults, Engine, EngineOptions, RetryPolicy};
pub use self::error::{ErrorKind, ExecError};
pub use self::events::{EventBus, RunEvent};
pub use self::pool::{ConnectionPool, PoolConfig, PoolMetrics};

pub use tokio_util::sync::CancellationToken;
