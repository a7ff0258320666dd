//! Target-agnostic command model
//!
//! The leaves of the engine: what to run ([`RunSpec`]), where to run it
//! ([`Target`]), what came back ([`ExecResult`]), and the quoting rules
//! template assembly uses.

pub mod quote;
pub mod result;
pub mod spec;
pub mod target;

pub use quote::ShellProfile;
pub use result::ExecResult;
pub use spec::{
    compose_env, Command, Encoding, EnvMode, OutputRouting, RunSpec, ShellSelection, StdinSource,
    DEFAULT_GRACE_PERIOD, DEFAULT_MAX_BUFFER,
};
pub use target::{
    AlgorithmConfig, AuthConfig, AuthMethod, DockerConfig, DockerMode, EnvMap, K8sConfig,
    KeepAliveConfig, LocalConfig, PrivateKeyAuth, SshConfig, SudoConfig, SudoMethod, Target,
    TargetKind, TlsConfig,
};
