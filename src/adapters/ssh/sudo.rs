//! Sudo password delivery strategies
//!
//! Five methods, all sharing one rule: the password never appears in any
//! argv a remote `ps` could observe. Script and password files travel over
//! channel stdin; the command string only ever names paths.

use bytes::Bytes;
use tracing::warn;
use uuid::Uuid;

use crate::core::quote::{self, ShellProfile};
use crate::core::{SudoConfig, SudoMethod};
use crate::error::ExecError;

/// A remote upload performed before the main command: the setup command
/// reads the payload from its stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SudoUpload {
    pub command: String,
    pub payload: Bytes,
}

/// How a run's command string and stdin change to satisfy sudo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SudoPlan {
    /// Wrapped command replacing the original
    pub command: String,
    /// Bytes written to the channel before user stdin (`sudo -S` methods)
    pub stdin_prelude: Option<Bytes>,
    /// Upload executed on a separate channel before the run
    pub upload: Option<SudoUpload>,
    /// Housekeeping command executed after the run on any exit path
    pub cleanup: Option<String>,
}

/// Build the wrapping for one sudo-enabled run.
pub(crate) fn build_sudo_plan(base: &str, sudo: &SudoConfig) -> Result<SudoPlan, ExecError> {
    let method = match sudo.method {
        SudoMethod::Echo => {
            warn!("sudo method `echo` is deprecated; using `stdin` semantics");
            SudoMethod::Stdin
        }
        m => m,
    };

    let prompt_flag = match &sudo.prompt {
        Some(prompt) => format!(" -p {}", quote::quote(ShellProfile::Posix, prompt)),
        None => String::new(),
    };

    match method {
        SudoMethod::SecureAskpass => {
            let password = required_password(sudo)?;
            let script_path = format!("/tmp/askpass-{}.sh", short_id());
            let quoted_path = quote::quote(ShellProfile::Posix, &script_path);
            Ok(SudoPlan {
                command: format!(
                    "SUDO_ASKPASS={} sudo -A{} -- {}",
                    quoted_path, prompt_flag, base
                ),
                stdin_prelude: None,
                upload: Some(SudoUpload {
                    command: format!(
                        "umask 077 && cat > {} && chmod 700 {}",
                        quoted_path, quoted_path
                    ),
                    payload: askpass_script(password),
                }),
                cleanup: Some(format!("rm -f {}", quoted_path)),
            })
        }
        SudoMethod::Secure => {
            let password = required_password(sudo)?;
            let pw_path = format!("/tmp/sudo-pw-{}", short_id());
            let quoted_path = quote::quote(ShellProfile::Posix, &pw_path);
            let mut payload = Vec::with_capacity(password.len() + 1);
            payload.extend_from_slice(password.as_bytes());
            payload.push(b'\n');
            Ok(SudoPlan {
                command: format!("sudo -S -p '' -- {} < {}", base, quoted_path),
                stdin_prelude: None,
                upload: Some(SudoUpload {
                    command: format!("umask 077 && cat > {}", quoted_path),
                    payload: Bytes::from(payload),
                }),
                cleanup: Some(format!("rm -f {}", quoted_path)),
            })
        }
        SudoMethod::Askpass => {
            // The server's own SUDO_ASKPASS does the prompting; nothing to
            // upload and no password material involved.
            Ok(SudoPlan {
                command: format!("sudo -A{} -- {}", prompt_flag, base),
                stdin_prelude: None,
                upload: None,
                cleanup: None,
            })
        }
        SudoMethod::Stdin | SudoMethod::Echo => {
            let password = required_password(sudo)?;
            let mut prelude = Vec::with_capacity(password.len() + 1);
            prelude.extend_from_slice(password.as_bytes());
            prelude.push(b'\n');
            Ok(SudoPlan {
                command: format!("sudo -S -p '' -- {}", base),
                stdin_prelude: Some(Bytes::from(prelude)),
                upload: None,
                cleanup: None,
            })
        }
    }
}

/// One-line POSIX askpass body behind a `/bin/sh` shebang, mode 0700.
fn askpass_script(password: &str) -> Bytes {
    let quoted = quote::quote(ShellProfile::Posix, password);
    Bytes::from(format!("#!/bin/sh\nprintf %s {}\n", quoted))
}

fn required_password(sudo: &SudoConfig) -> Result<&str, ExecError> {
    sudo.password.as_deref().ok_or_else(|| ExecError::InvalidSpec {
        message: format!("sudo method {:?} requires a password", sudo.method),
    })
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(method: SudoMethod, password: Option<&str>) -> SudoConfig {
        SudoConfig {
            method,
            password: password.map(str::to_string),
            prompt: None,
        }
    }

    #[test]
    fn test_secure_askpass_uploads_script_and_cleans_up() {
        let plan =
            build_sudo_plan("whoami", &config(SudoMethod::SecureAskpass, Some("s3cret"))).unwrap();

        let upload = plan.upload.expect("askpass upload");
        assert!(upload.command.starts_with("umask 077 && cat > /tmp/askpass-"));
        assert!(upload.command.contains("chmod 700"));
        let script = String::from_utf8(upload.payload.to_vec()).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("printf %s s3cret"));

        assert!(plan.command.starts_with("SUDO_ASKPASS=/tmp/askpass-"));
        assert!(plan.command.contains("sudo -A -- whoami"));
        // The password travels in the upload payload, never the command.
        assert!(!plan.command.contains("s3cret"));
        assert!(plan.cleanup.unwrap().starts_with("rm -f /tmp/askpass-"));
        assert!(plan.stdin_prelude.is_none());
    }

    #[test]
    fn test_secure_uses_password_file() {
        let plan = build_sudo_plan("id", &config(SudoMethod::Secure, Some("pw"))).unwrap();
        let upload = plan.upload.expect("password upload");
        assert_eq!(&upload.payload[..], b"pw\n");
        assert!(upload.command.starts_with("umask 077 && cat > /tmp/sudo-pw-"));
        assert!(plan.command.starts_with("sudo -S -p '' -- id < /tmp/sudo-pw-"));
        assert!(!plan.command.contains("pw\n"));
        assert!(plan.cleanup.is_some());
    }

    #[test]
    fn test_stdin_method_uses_prelude() {
        let plan = build_sudo_plan("id", &config(SudoMethod::Stdin, Some("hunter2"))).unwrap();
        assert_eq!(plan.command, "sudo -S -p '' -- id");
        assert_eq!(&plan.stdin_prelude.unwrap()[..], b"hunter2\n");
        assert!(plan.upload.is_none());
        assert!(plan.cleanup.is_none());
        assert!(!plan.command.contains("hunter2"));
    }

    #[test]
    fn test_echo_behaves_like_stdin() {
        let plan = build_sudo_plan("id", &config(SudoMethod::Echo, Some("pw"))).unwrap();
        assert_eq!(plan.command, "sudo -S -p '' -- id");
        assert!(plan.stdin_prelude.is_some());
    }

    #[test]
    fn test_askpass_needs_no_password() {
        let plan = build_sudo_plan("id", &config(SudoMethod::Askpass, None)).unwrap();
        assert_eq!(plan.command, "sudo -A -- id");
        assert!(plan.upload.is_none());
        assert!(plan.stdin_prelude.is_none());
    }

    #[test]
    fn test_password_required_for_secret_methods() {
        for method in [SudoMethod::SecureAskpass, SudoMethod::Secure, SudoMethod::Stdin] {
            let err = build_sudo_plan("id", &config(method, None)).unwrap_err();
            assert!(matches!(err, ExecError::InvalidSpec { .. }));
        }
    }

    #[test]
    fn test_prompt_is_quoted() {
        let mut cfg = config(SudoMethod::Askpass, None);
        cfg.prompt = Some("pass for $(host)".to_string());
        let plan = build_sudo_plan("id", &cfg).unwrap();
        assert!(plan.command.contains("-p 'pass for $(host)'"));
    }

    #[test]
    fn test_script_paths_are_unique() {
        let a = build_sudo_plan("id", &config(SudoMethod::SecureAskpass, Some("x"))).unwrap();
        let b = build_sudo_plan("id", &config(SudoMethod::SecureAskpass, Some("x"))).unwrap();
        assert_ne!(a.command, b.command);
    }
}
