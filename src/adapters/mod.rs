//! Adapter layer
//!
//! One adapter per target family, all implementing the same contract:
//! take a frozen [`RunSpec`], start the process, hand back a live
//! [`RunHandle`]. Everything above this boundary (routing, buffering,
//! timeout and cancellation) is target-agnostic.

pub mod docker;
mod handle;
pub mod k8s;
pub mod local;
pub mod ssh;

pub use handle::{ExitStatus, ProcessControl, RunHandle};
pub(crate) use handle::{spawn_reader_pump, spawn_stdin_feed, CHUNK_CHANNEL_CAPACITY};

use async_trait::async_trait;

use crate::core::{quote, Command, EnvMap, EnvMode, RunSpec, ShellProfile, Target, TargetKind};
use crate::error::ExecError;

/// The uniform contract every target family implements.
///
/// `execute` may take ownership of the spec's stdin payload (readers are
/// one-shot); everything else in the spec is read-only.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> TargetKind;

    async fn execute(&self, target: &Target, spec: &mut RunSpec) -> Result<RunHandle, ExecError>;
}

// ============================================================================
// Signal names
// ============================================================================

/// Strip an optional `SIG` prefix and uppercase: `sigterm` -> `TERM`.
pub(crate) fn normalize_signal(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    upper.strip_prefix("SIG").map(str::to_string).unwrap_or(upper)
}

/// Conventional signal numbers for the names the engine delivers.
pub(crate) fn signal_number(name: &str) -> Option<i32> {
    match normalize_signal(name).as_str() {
        "HUP" => Some(1),
        "INT" => Some(2),
        "QUIT" => Some(3),
        "KILL" => Some(9),
        "USR1" => Some(10),
        "USR2" => Some(12),
        "PIPE" => Some(13),
        "ALRM" => Some(14),
        "TERM" => Some(15),
        _ => None,
    }
}

/// Name for a raw signal number (exit-status reporting).
pub(crate) fn signal_name(number: i32) -> String {
    match number {
        1 => "HUP".to_string(),
        2 => "INT".to_string(),
        3 => "QUIT".to_string(),
        9 => "KILL".to_string(),
        10 => "USR1".to_string(),
        12 => "USR2".to_string(),
        13 => "PIPE".to_string(),
        14 => "ALRM".to_string(),
        15 => "TERM".to_string(),
        n => n.to_string(),
    }
}

// ============================================================================
// Argv assembly shared by the container adapters
// ============================================================================

/// Resolve a spec command to argv for targets that always exec argv
/// (Docker exec, Kubernetes). Shell-mode commands become
/// `[shell, "-c", script]`.
pub(crate) fn argv_for_exec(command: &Command, default_shell: &str) -> Vec<String> {
    match command {
        Command::Shell { script, shell } => {
            let program = match shell {
                crate::core::ShellSelection::Auto => default_shell.to_string(),
                crate::core::ShellSelection::Named(name) => name.clone(),
            };
            vec![program, "-c".to_string(), script.clone()]
        }
        Command::Exec { argv } => argv.clone(),
    }
}

/// Wrap argv so env and cwd apply inside the remote process, for targets
/// whose exec API cannot set them directly.
///
/// Environment-only wrapping uses POSIX `env` (with `-i` for a full
/// replacement); a working directory forces the `sh -c 'cd ...; exec ...'`
/// form because `env -C` is not portable.
pub(crate) fn wrap_argv(
    argv: Vec<String>,
    env: &EnvMap,
    env_mode: EnvMode,
    cwd: Option<&std::path::Path>,
) -> Vec<String> {
    let replace_all = matches!(env_mode, EnvMode::ReplaceAll);
    if env.is_empty() && cwd.is_none() && !replace_all {
        return argv;
    }

    match cwd {
        Some(dir) => {
            let mut script = String::new();
            script.push_str("cd ");
            script.push_str(&quote::quote(ShellProfile::Posix, &dir.to_string_lossy()));
            script.push_str(" && ");
            if replace_all {
                script.push_str("exec env -i ");
            } else if !env.is_empty() {
                script.push_str("exec env ");
            } else {
                script.push_str("exec ");
            }
            for (k, v) in env {
                script.push_str(&quote::quote(
                    ShellProfile::Posix,
                    &format!("{}={}", k, v),
                ));
                script.push(' ');
            }
            script.push_str(&quote::join(ShellProfile::Posix, &argv));
            vec!["sh".to_string(), "-c".to_string(), script]
        }
        None => {
            let mut wrapped = vec!["env".to_string()];
            if replace_all {
                wrapped.push("-i".to_string());
            }
            for (k, v) in env {
                wrapped.push(format!("{}={}", k, v));
            }
            wrapped.extend(argv);
            wrapped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ShellSelection;
    use std::path::Path;

    #[test]
    fn test_normalize_signal() {
        assert_eq!(normalize_signal("SIGTERM"), "TERM");
        assert_eq!(normalize_signal("term"), "TERM");
        assert_eq!(normalize_signal("KILL"), "KILL");
    }

    #[test]
    fn test_signal_numbers_round_trip() {
        for name in ["HUP", "INT", "QUIT", "KILL", "TERM", "USR1", "USR2"] {
            let n = signal_number(name).unwrap();
            assert_eq!(signal_name(n), name);
        }
        assert_eq!(signal_number("WINCH"), None);
    }

    #[test]
    fn test_argv_for_exec_shell_mode() {
        let cmd = Command::Shell {
            script: "printf a; printf b >&2".to_string(),
            shell: ShellSelection::Auto,
        };
        assert_eq!(
            argv_for_exec(&cmd, "sh"),
            vec!["sh", "-c", "printf a; printf b >&2"]
        );

        let named = Command::Shell {
            script: "echo hi".to_string(),
            shell: ShellSelection::Named("bash".to_string()),
        };
        assert_eq!(argv_for_exec(&named, "sh")[0], "bash");
    }

    #[test]
    fn test_wrap_argv_env_only() {
        let argv = vec!["cat".to_string(), "/etc/hostname".to_string()];
        let env = vec![("FOO".to_string(), "bar".to_string())];
        let wrapped = wrap_argv(argv, &env, EnvMode::InheritOverlay, None);
        assert_eq!(wrapped, vec!["env", "FOO=bar", "cat", "/etc/hostname"]);
    }

    #[test]
    fn test_wrap_argv_replace_all_uses_env_i() {
        let wrapped = wrap_argv(
            vec!["id".to_string()],
            &vec![("A".to_string(), "1".to_string())],
            EnvMode::ReplaceAll,
            None,
        );
        assert_eq!(wrapped, vec!["env", "-i", "A=1", "id"]);
    }

    #[test]
    fn test_wrap_argv_cwd_uses_shell() {
        let wrapped = wrap_argv(
            vec!["ls".to_string(), "-la".to_string()],
            &vec![("K".to_string(), "v space".to_string())],
            EnvMode::InheritOverlay,
            Some(Path::new("/srv/app")),
        );
        assert_eq!(wrapped[0], "sh");
        assert_eq!(wrapped[1], "-c");
        assert_eq!(wrapped[2], "cd /srv/app && exec env 'K=v space' ls -la");
    }

    #[test]
    fn test_wrap_argv_noop_without_env_or_cwd() {
        let argv = vec!["uptime".to_string()];
        assert_eq!(
            wrap_argv(argv.clone(), &Vec::new(), EnvMode::InheritOverlay, None),
            argv
        );
    }
}
