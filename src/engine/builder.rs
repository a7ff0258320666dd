//! Chainable command builder
//!
//! Collects modifiers by value and freezes into a [`RunSpec`] when run.
//! Ownership is the commit point: every modifier consumes and returns the
//! builder, and `run()` consumes it outright, so a dispatched spec can
//! never be mutated and a frozen builder cannot affect a prior result.

use std::future::{Future, IntoFuture};
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{dispatch, Engine};
use crate::core::quote::{self, ShellProfile};
use crate::core::spec::{SharedWriter, StdinReader};
use crate::core::{
    Command, Encoding, EnvMap, EnvMode, ExecResult, OutputRouting, RunSpec, ShellSelection,
    StdinSource, SudoConfig, Target,
};
use crate::error::{ErrorKind, ExecError};

/// Exponential backoff retry wrapping for a single builder.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Error kinds that trigger another attempt
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            retry_on: vec![ErrorKind::Connect, ErrorKind::Timeout, ErrorKind::PoolExhausted],
        }
    }
}

impl RetryPolicy {
    pub fn retries(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Opt command failures (non-zero exits) into retrying.
    pub fn including_command_errors(mut self) -> Self {
        if !self.retry_on.contains(&ErrorKind::Command) {
            self.retry_on.push(ErrorKind::Command);
        }
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

enum CommandDraft {
    Shell(String),
    Exec(Vec<String>),
}

enum ArgToken {
    One(String),
    Many(Vec<String>),
    /// Another builder whose captured stdout becomes the argument
    Nested(Box<CommandBuilder>),
}

/// Lazily-configured run. Chain modifiers, then `.run().await` (or await
/// the builder directly).
pub struct CommandBuilder {
    engine: Engine,
    target: Target,
    draft: CommandDraft,
    args: Vec<ArgToken>,
    shell_selection: Option<ShellSelection>,
    use_shell: bool,
    stdin: StdinSource,
    stdout_routing: Option<OutputRouting>,
    stderr_routing: Option<OutputRouting>,
    env: EnvMap,
    env_mode: Option<EnvMode>,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
    kill_signal: Option<String>,
    grace_period: Option<Duration>,
    encoding: Option<Encoding>,
    max_buffer: Option<usize>,
    quiet: Option<bool>,
    nothrow: bool,
    cancel: CancellationToken,
    sudo: Option<SudoConfig>,
    retry: Option<RetryPolicy>,
    upstream: Option<Box<CommandBuilder>>,
}

impl CommandBuilder {
    pub(crate) fn from_shell(engine: Engine, script: String) -> Self {
        let target = engine.current_target().clone();
        Self::new(engine, target, CommandDraft::Shell(script))
    }

    pub(crate) fn from_exec(engine: Engine, argv: Vec<String>) -> Self {
        let target = engine.current_target().clone();
        Self::new(engine, target, CommandDraft::Exec(argv))
    }

    fn new(engine: Engine, target: Target, draft: CommandDraft) -> Self {
        Self {
            engine,
            target,
            draft,
            args: Vec::new(),
            shell_selection: None,
            use_shell: true,
            stdin: StdinSource::Null,
            stdout_routing: None,
            stderr_routing: None,
            env: Vec::new(),
            env_mode: None,
            cwd: None,
            timeout: None,
            kill_signal: None,
            grace_period: None,
            encoding: None,
            max_buffer: None,
            quiet: None,
            nothrow: false,
            cancel: CancellationToken::new(),
            sudo: None,
            retry: None,
            upstream: None,
        }
    }

    // -- arguments -----------------------------------------------------------

    /// Fill the next `{}` placeholder (shell mode: quoted; argv mode:
    /// appended verbatim as one element).
    pub fn arg(mut self, value: impl ToString) -> Self {
        self.args.push(ArgToken::One(value.to_string()));
        self
    }

    /// Fill the next `{}` placeholder with an iterable, expanded as
    /// space-separated quoted tokens (argv mode: one element each).
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args
            .push(ArgToken::Many(values.into_iter().map(|v| v.to_string()).collect()));
        self
    }

    /// Fill the next `{}` placeholder with another builder's captured
    /// stdout (trimmed), running it first.
    pub fn arg_output(mut self, builder: CommandBuilder) -> Self {
        self.args.push(ArgToken::Nested(Box::new(builder)));
        self
    }

    // -- modifiers -----------------------------------------------------------

    /// Working directory, resolved on the target.
    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn env_mode(mut self, mode: EnvMode) -> Self {
        self.env_mode = Some(mode);
        self
    }

    /// Total wall-clock budget. `Duration::ZERO` disables the timer.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Signal sent on timeout/cancel before escalation to KILL.
    pub fn kill_signal(mut self, signal: impl Into<String>) -> Self {
        self.kill_signal = Some(signal.into());
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    /// Select a named shell for shell-mode commands.
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell_selection = Some(ShellSelection::Named(shell.into()));
        self.use_shell = true;
        self
    }

    /// Run without any shell; a shell-mode script is split into argv.
    pub fn no_shell(mut self) -> Self {
        self.use_shell = false;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn max_buffer(mut self, bytes: usize) -> Self {
        self.max_buffer = Some(bytes);
        self
    }

    /// Fixed stdin payload.
    pub fn stdin(mut self, bytes: impl Into<Bytes>) -> Self {
        self.stdin = StdinSource::Bytes(bytes.into());
        self
    }

    /// Streamed stdin. One-shot: combined with `.retry`, only the first
    /// attempt sees the data.
    pub fn stdin_reader(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = StdinSource::Reader(Box::new(reader) as StdinReader);
        self
    }

    /// Inherit the parent's stdin (local targets).
    pub fn stdin_inherit(mut self) -> Self {
        self.stdin = StdinSource::Inherit;
        self
    }

    /// Feed this builder's stdout into `downstream`'s stdin, forming a
    /// pipeline. Returns the downstream builder; awaiting it runs both.
    pub fn pipe(self, mut downstream: CommandBuilder) -> CommandBuilder {
        downstream.upstream = Some(Box::new(self));
        downstream
    }

    /// Stream stdout into a writer instead of capturing it.
    pub fn stdout_to(mut self, writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout_routing = Some(OutputRouting::Sink(shared(writer)));
        self
    }

    /// Capture stdout and stream it into a writer.
    pub fn tee_stdout(mut self, writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout_routing = Some(OutputRouting::Tee(shared(writer)));
        self
    }

    pub fn stderr_to(mut self, writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr_routing = Some(OutputRouting::Sink(shared(writer)));
        self
    }

    pub fn tee_stderr(mut self, writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr_routing = Some(OutputRouting::Tee(shared(writer)));
        self
    }

    pub fn ignore_stdout(mut self) -> Self {
        self.stdout_routing = Some(OutputRouting::Ignore);
        self
    }

    pub fn ignore_stderr(mut self) -> Self {
        self.stderr_routing = Some(OutputRouting::Ignore);
        self
    }

    /// Capture quietly (the default routing; undoes an inherited verbose).
    pub fn quiet(mut self) -> Self {
        self.quiet = Some(true);
        self
    }

    /// Attach stdio to the parent (remote output is forwarded).
    pub fn verbose(mut self) -> Self {
        self.quiet = Some(false);
        self
    }

    /// Non-zero exits yield a result instead of a `Command` error.
    pub fn nothrow(mut self) -> Self {
        self.nothrow = true;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// External cancellation. Cancelling before dispatch resolves without
    /// ever borrowing a connection.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sudo wrapping for SSH targets (overrides the target's config).
    pub fn sudo(mut self, sudo: SudoConfig) -> Self {
        self.sudo = Some(sudo);
        self
    }

    // -- execution -----------------------------------------------------------

    /// Freeze and execute. Consuming `self` is the freeze: nothing can
    /// touch the spec after this point.
    pub async fn run(mut self) -> Result<ExecResult, ExecError> {
        // Nested interpolation arguments run first, depth-first.
        let mut resolved = Vec::with_capacity(self.args.len());
        for token in std::mem::take(&mut self.args) {
            match token {
                ArgToken::Nested(builder) => {
                    let result = Box::pin(builder.run()).await?;
                    resolved.push(ArgToken::One(result.text()));
                }
                other => resolved.push(other),
            }
        }
        self.args = resolved;

        // A pipeline runs both ends concurrently over an in-memory duplex;
        // dropping the upstream spec closes the writer and delivers EOF.
        if let Some(upstream) = self.upstream.take() {
            let (reader, writer) = tokio::io::duplex(64 * 1024);
            let upstream = upstream.stdout_to(writer);
            self.stdin = StdinSource::Reader(Box::new(reader) as StdinReader);

            let (up, down) = tokio::join!(Box::pin(upstream.run()), Box::pin(self.run_single()));
            return match (up, down) {
                (Err(e), _) => Err(e),
                (Ok(_), result) => result,
            };
        }

        self.run_single().await
    }

    async fn run_single(self) -> Result<ExecResult, ExecError> {
        let engine = self.engine.clone();
        let (target, spec, retry) = self.freeze()?;
        let inner = engine.inner().clone();

        let Some(policy) = retry else {
            return dispatch(&inner, &target, spec).await;
        };

        let mut attempt = 1u32;
        let mut current = spec;
        loop {
            let next = current.try_clone();
            match dispatch(&inner, &target, current).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= policy.max_attempts || !policy.retries(e.kind()) {
                        return Err(e);
                    }
                    // One-shot stdin readers cannot replay into a retry.
                    let Some(next_spec) = next else { return Err(e) };
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt,
                        max = policy.max_attempts,
                        error = %e,
                        ?delay,
                        "run failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    current = next_spec;
                }
            }
        }
    }

    /// Assemble the immutable spec: builder values win over engine
    /// defaults, which win over target-level configuration.
    fn freeze(self) -> Result<(Target, RunSpec, Option<RetryPolicy>), ExecError> {
        let defaults = self.engine.current_defaults().clone();
        let target = self.target;

        let (target_env, target_cwd, target_sudo) = target_overlays(&target);
        let (target_kill, target_timeout, target_max_buffer, target_encoding) =
            local_overlays(&target);

        // Ordered env: target config first, then engine defaults, then the
        // builder's own entries. Later entries win at composition time.
        let mut env = target_env;
        env.extend(defaults.env.iter().cloned());
        env.extend(self.env);

        let shell_selection = self
            .shell_selection
            .or_else(|| defaults.shell.clone())
            .unwrap_or_default();

        let command = match self.draft {
            CommandDraft::Shell(template) => {
                let script = interpolate(&template, &self.args)?;
                if self.use_shell {
                    Command::Shell {
                        script,
                        shell: shell_selection,
                    }
                } else {
                    Command::Exec {
                        argv: quote::split(&script)?,
                    }
                }
            }
            CommandDraft::Exec(mut argv) => {
                for token in self.args {
                    match token {
                        ArgToken::One(value) => argv.push(value),
                        ArgToken::Many(values) => argv.extend(values),
                        ArgToken::Nested(_) => unreachable!("nested args resolved before freeze"),
                    }
                }
                Command::Exec { argv }
            }
        };

        let quiet = self.quiet.or(defaults.quiet);
        let default_routing = match quiet {
            Some(false) => OutputRouting::Inherit,
            _ => OutputRouting::Capture,
        };
        let stdout = self.stdout_routing.unwrap_or_else(|| default_routing.clone());
        let stderr = self.stderr_routing.unwrap_or(default_routing);

        let spec = RunSpec {
            command,
            stdin: self.stdin,
            stdout,
            stderr,
            env,
            env_mode: self.env_mode.or(defaults.env_mode).unwrap_or_default(),
            cwd: self.cwd.or_else(|| defaults.cwd.clone()).or(target_cwd),
            timeout: self.timeout.or(defaults.timeout).or(target_timeout),
            kill_signal: self
                .kill_signal
                .or_else(|| defaults.kill_signal.clone())
                .or(target_kill)
                .unwrap_or_else(|| "TERM".to_string()),
            grace_period: self
                .grace_period
                .or(defaults.grace_period)
                .unwrap_or(crate::core::DEFAULT_GRACE_PERIOD),
            encoding: self
                .encoding
                .or(defaults.encoding)
                .or(target_encoding)
                .unwrap_or_default(),
            max_buffer: self
                .max_buffer
                .or(defaults.max_buffer)
                .or(target_max_buffer)
                .unwrap_or(crate::core::DEFAULT_MAX_BUFFER),
            throw_on_non_zero: if self.nothrow {
                false
            } else {
                defaults.throw_on_non_zero.unwrap_or(true)
            },
            cancel: self.cancel,
            sudo: self.sudo.or(target_sudo),
        };

        spec.validate()?;
        Ok((target, spec, self.retry))
    }
}

fn shared(writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> SharedWriter {
    std::sync::Arc::new(tokio::sync::Mutex::new(writer))
}

/// Env/cwd/sudo configured on the target itself.
fn target_overlays(target: &Target) -> (EnvMap, Option<PathBuf>, Option<SudoConfig>) {
    match target {
        Target::Local(_) => (Vec::new(), None, None),
        Target::Ssh(cfg) => (cfg.env.clone(), cfg.cwd.clone(), cfg.sudo.clone()),
        Target::Docker(cfg) => (cfg.env.clone(), cfg.cwd.clone(), None),
        Target::Kubernetes(cfg) => (cfg.env.clone(), cfg.cwd.clone(), None),
    }
}

/// Defaults only the local target carries in its config table.
fn local_overlays(
    target: &Target,
) -> (
    Option<String>,
    Option<Duration>,
    Option<usize>,
    Option<Encoding>,
) {
    match target {
        Target::Local(cfg) => (
            cfg.kill_signal.clone(),
            cfg.default_timeout_ms.map(Duration::from_millis),
            cfg.max_buffer,
            cfg.encoding.as_deref().map(parse_encoding),
        ),
        _ => (None, None, None, None),
    }
}

fn parse_encoding(name: &str) -> Encoding {
    match name.to_ascii_lowercase().as_str() {
        "raw" | "binary" | "buffer" => Encoding::Raw,
        _ => Encoding::Utf8,
    }
}

/// Substitute `{}` placeholders with quoted arguments; leftover arguments
/// append at the end, space-separated.
fn interpolate(template: &str, tokens: &[ArgToken]) -> Result<String, ExecError> {
    let parts: Vec<&str> = template.split("{}").collect();
    let placeholders = parts.len() - 1;
    if placeholders > tokens.len() {
        return Err(ExecError::InvalidSpec {
            message: format!(
                "{} placeholders but only {} arguments",
                placeholders,
                tokens.len()
            ),
        });
    }

    let mut out = String::with_capacity(template.len());
    for (i, part) in parts.iter().enumerate() {
        out.push_str(part);
        if i < placeholders {
            out.push_str(&render_token(&tokens[i]));
        }
    }
    for token in &tokens[placeholders..] {
        out.push(' ');
        out.push_str(&render_token(token));
    }
    Ok(out)
}

fn render_token(token: &ArgToken) -> String {
    match token {
        ArgToken::One(value) => quote::quote(ShellProfile::Posix, value),
        ArgToken::Many(values) => quote::join(ShellProfile::Posix, values),
        ArgToken::Nested(_) => unreachable!("nested args resolved before interpolation"),
    }
}

impl IntoFuture for CommandBuilder {
    type Output = Result<ExecResult, ExecError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Defaults;

    fn engine() -> Engine {
        Engine::default()
    }

    fn freeze(builder: CommandBuilder) -> (Target, RunSpec, Option<RetryPolicy>) {
        builder.freeze().unwrap()
    }

    #[test]
    fn test_interpolation_quotes_arguments() {
        let b = engine().shell("curl {}").arg("https://x.test/a b");
        let (_, spec, _) = freeze(b);
        match spec.command {
            Command::Shell { script, .. } => {
                assert_eq!(script, "curl 'https://x.test/a b'");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_iterable_expands_space_separated() {
        let b = engine()
            .shell("tar -czf {} {}")
            .arg("out.tgz")
            .args(["a.txt", "b c.txt"]);
        let (_, spec, _) = freeze(b);
        match spec.command {
            Command::Shell { script, .. } => {
                assert_eq!(script, "tar -czf out.tgz a.txt 'b c.txt'");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_extra_args_append() {
        let b = engine().shell("echo").arg("hello world");
        let (_, spec, _) = freeze(b);
        match spec.command {
            Command::Shell { script, .. } => assert_eq!(script, "echo 'hello world'"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_missing_placeholder_argument_rejected() {
        let err = engine().shell("cp {} {}").arg("only-one").freeze();
        assert!(matches!(err, Err(ExecError::InvalidSpec { .. })));
    }

    #[test]
    fn test_exec_args_are_verbatim() {
        let b = engine().exec(["echo"]).arg("a b").args(["c", "d e"]);
        let (_, spec, _) = freeze(b);
        match spec.command {
            Command::Exec { argv } => assert_eq!(argv, vec!["echo", "a b", "c", "d e"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_no_shell_splits_script() {
        let b = engine().shell("echo 'a b' c").no_shell();
        let (_, spec, _) = freeze(b);
        match spec.command {
            Command::Exec { argv } => assert_eq!(argv, vec!["echo", "a b", "c"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_nothrow_clears_throw_flag() {
        let (_, spec, _) = freeze(engine().shell("exit 7").nothrow());
        assert!(!spec.throw_on_non_zero);
        let (_, spec, _) = freeze(engine().shell("exit 7"));
        assert!(spec.throw_on_non_zero);
    }

    #[test]
    fn test_defaults_compose_right_wins() {
        let base = engine().with(Defaults {
            timeout: Some(Duration::from_secs(10)),
            env: vec![("A".into(), "1".into())],
            ..Defaults::default()
        });
        let layered = base.with(Defaults {
            timeout: Some(Duration::from_secs(5)),
            env: vec![("B".into(), "2".into())],
            ..Defaults::default()
        });

        let (_, spec, _) = freeze(layered.shell("true"));
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
        assert_eq!(
            spec.env,
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn test_builder_value_semantics() {
        // Each modifier application produces an independent value; cloning
        // the engine and branching builders cannot interfere.
        let e = engine();
        let (_, spec_a, _) = freeze(e.shell("true").timeout(Duration::from_secs(1)));
        let (_, spec_b, _) = freeze(e.shell("true"));
        assert_eq!(spec_a.timeout, Some(Duration::from_secs(1)));
        assert_eq!(spec_b.timeout, None);
    }

    #[test]
    fn test_target_env_layering() {
        let mut ssh = crate::core::SshConfig::new("h", "u");
        ssh.env = vec![("FROM_TARGET".into(), "1".into()), ("X".into(), "t".into())];
        let scoped = engine().ssh(ssh).with(Defaults {
            env: vec![("X".into(), "d".into())],
            ..Defaults::default()
        });
        let (_, spec, _) = freeze(scoped.shell("true").env("X", "b"));

        // Composition order: target, defaults, builder. Later wins when
        // composed into the child environment.
        let composed = crate::core::compose_env(Vec::new(), &spec.env, EnvMode::ReplaceAll);
        assert_eq!(
            composed.iter().find(|(k, _)| k == "X").map(|(_, v)| v.as_str()),
            Some("b")
        );
        assert!(composed.iter().any(|(k, _)| k == "FROM_TARGET"));
    }

    #[test]
    fn test_quiet_and_verbose_routing() {
        let (_, spec, _) = freeze(engine().shell("true"));
        assert!(matches!(spec.stdout, OutputRouting::Capture));

        let (_, spec, _) = freeze(engine().shell("true").verbose());
        assert!(matches!(spec.stdout, OutputRouting::Inherit));
        assert!(matches!(spec.stderr, OutputRouting::Inherit));

        let verbose_engine = engine().with(Defaults {
            quiet: Some(false),
            ..Defaults::default()
        });
        let (_, spec, _) = freeze(verbose_engine.shell("true").quiet());
        assert!(matches!(spec.stdout, OutputRouting::Capture));
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        let capped = RetryPolicy {
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert_eq!(capped.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_classes() {
        let policy = RetryPolicy::default();
        assert!(policy.retries(ErrorKind::Connect));
        assert!(policy.retries(ErrorKind::Timeout));
        assert!(!policy.retries(ErrorKind::Command));
        assert!(policy.including_command_errors().retries(ErrorKind::Command));
    }

    #[tokio::test]
    async fn test_run_local_echo() {
        let result = engine().shell("echo hello").run().await.unwrap();
        assert!(result.ok());
        assert_eq!(result.stdout(), "hello\n");
        assert_eq!(result.stderr(), "");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_await_builder_directly() {
        let result = engine().shell("printf hi").await.unwrap();
        assert_eq!(result.text(), "hi");
    }

    #[tokio::test]
    async fn test_nonzero_without_nothrow_is_command_error() {
        let err = engine().shell("sh -c 'exit 7'").run().await.unwrap_err();
        match err {
            ExecError::Command { exit_code, .. } => assert_eq!(exit_code, 7),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_with_nothrow_is_result() {
        let result = engine().shell("exit 7").nothrow().run().await.unwrap();
        assert_eq!(result.exit_code, 7);
        assert!(!result.ok());
    }

    #[tokio::test]
    async fn test_timeout_yields_timeout_error() {
        let started = std::time::Instant::now();
        let err = engine()
            .shell("sleep 5")
            .timeout(Duration::from_millis(100))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let token = CancellationToken::new();
        token.cancel();
        let err = engine()
            .shell("echo never")
            .cancel_token(token)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cancel_mid_run() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = engine()
            .shell("sleep 5")
            .cancel_token(token)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_max_buffer_boundary() {
        // Exactly at the limit: fine.
        let result = engine()
            .shell("printf abcde")
            .max_buffer(5)
            .run()
            .await
            .unwrap();
        assert_eq!(result.stdout(), "abcde");

        // One byte over: overflow error and the process is gone.
        let err = engine()
            .shell("printf abcdef")
            .max_buffer(5)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::BufferOverflow { limit: 5, .. }));
    }

    #[tokio::test]
    async fn test_stdin_pipe_through_cat() {
        let result = engine()
            .shell("cat")
            .stdin("line one\nline two\n")
            .run()
            .await
            .unwrap();
        assert_eq!(result.stdout(), "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_pipeline_feeds_downstream() {
        let upstream = engine().shell("printf 'b\\na\\nc\\n'");
        let result = upstream.pipe(engine().shell("sort")).run().await.unwrap();
        assert_eq!(result.stdout(), "a\nb\nc\n");
    }

    #[tokio::test]
    async fn test_pipeline_upstream_failure_wins() {
        let upstream = engine().shell("exit 3");
        let err = upstream.pipe(engine().shell("cat")).run().await.unwrap_err();
        match err {
            ExecError::Command { exit_code, .. } => assert_eq!(exit_code, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nested_builder_argument() {
        let inner = engine().shell("printf inner-value");
        let result = engine()
            .shell("echo {}")
            .arg_output(inner)
            .run()
            .await
            .unwrap();
        assert_eq!(result.text(), "inner-value");
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_command_error() {
        let started = std::time::Instant::now();
        let err = engine()
            .shell("exit 1")
            .retry(RetryPolicy {
                base_delay: Duration::from_millis(10),
                ..RetryPolicy::default()
            })
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Command { .. }));
        // No retries happened for a non-retryable class.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_command_errors_when_opted_in() {
        let err = engine()
            .shell("exit 1")
            .retry(RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                ..RetryPolicy::default()
            }
            .including_command_errors())
            .run()
            .await
            .unwrap_err();
        // Still fails, but only after the second attempt.
        assert!(matches!(err, ExecError::Command { .. }));
    }

    #[tokio::test]
    async fn test_tee_captures_and_streams() {
        let (reader, writer) = tokio::io::duplex(1024);
        let result = engine()
            .shell("printf teed")
            .tee_stdout(writer)
            .run()
            .await
            .unwrap();
        assert_eq!(result.stdout(), "teed");

        drop(result);
        let mut collected = Vec::new();
        use tokio::io::AsyncReadExt;
        let mut reader = reader;
        reader.read_to_end(&mut collected).await.unwrap();
        assert_eq!(collected, b"teed");
    }

    #[tokio::test]
    async fn test_sink_routing_does_not_capture() {
        let (reader, writer) = tokio::io::duplex(1024);
        let result = engine()
            .shell("printf sunk")
            .stdout_to(writer)
            .run()
            .await
            .unwrap();
        assert_eq!(result.stdout(), "");

        let mut collected = Vec::new();
        use tokio::io::AsyncReadExt;
        let mut reader = reader;
        reader.read_to_end(&mut collected).await.unwrap();
        assert_eq!(collected, b"sunk");
    }

    #[tokio::test]
    async fn test_events_fire_in_order() {
        let e = engine();
        let mut rx = e.events().subscribe();
        let result = e.shell("printf evt").run().await.unwrap();
        assert_eq!(result.text(), "evt");

        use crate::events::RunEvent;
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RunEvent::Started { .. }));
        let mut saw_stdout = false;
        loop {
            match rx.recv().await.unwrap() {
                RunEvent::Stdout { .. } => saw_stdout = true,
                RunEvent::Completed { result, .. } => {
                    assert_eq!(result.exit_code, 0);
                    break;
                }
                RunEvent::Failed { .. } => panic!("run should not fail"),
                _ => {}
            }
        }
        assert!(saw_stdout);
    }

    #[tokio::test]
    async fn test_failed_event_for_command_error() {
        let e = engine();
        let mut rx = e.events().subscribe();
        let _ = e.shell("exit 9").run().await.unwrap_err();

        use crate::events::RunEvent;
        loop {
            match rx.recv().await.unwrap() {
                RunEvent::Failed { kind, .. } => {
                    assert_eq!(kind, ErrorKind::Command);
                    break;
                }
                RunEvent::Completed { .. } => panic!("expected failure"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_result_duration_sane() {
        let before = chrono::Utc::now();
        let result = engine().shell("true").run().await.unwrap();
        let after = chrono::Utc::now();
        assert!(result.started_at >= before - chrono::Duration::seconds(1));
        assert!(result.started_at <= after);
        assert!(result.duration <= Duration::from_secs(10));
    }
}
