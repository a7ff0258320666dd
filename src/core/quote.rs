//! Per-shell argument escaping used by template assembly
//!
//! The POSIX profile delegates to `shell-words`, which implements the
//! quoting rules remote `sh -c` invocations expect. The cmd.exe profile
//! exists for local Windows shells and follows the usual caret/quote
//! doubling rules.

use std::borrow::Cow;

use crate::error::ExecError;

/// Quoting profile for a target shell family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellProfile {
    /// Bourne-compatible shells (`sh`, `bash`, `zsh`, remote SSH commands)
    #[default]
    Posix,
    /// Windows `cmd.exe`
    Cmd,
}

/// Quote a single token for the given profile.
pub fn quote(profile: ShellProfile, token: &str) -> String {
    match profile {
        ShellProfile::Posix => shell_words::quote(token).into_owned(),
        ShellProfile::Cmd => quote_cmd(token),
    }
}

/// Join argv into a single command line, quoting each token.
pub fn join<I, S>(profile: ShellProfile, argv: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    match profile {
        ShellProfile::Posix => shell_words::join(argv),
        ShellProfile::Cmd => argv
            .into_iter()
            .map(|t| quote_cmd(t.as_ref()))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Split a POSIX command line back into tokens. Inverse of [`join`] for the
/// POSIX profile; used when a shell string must run without a shell.
pub fn split(line: &str) -> Result<Vec<String>, ExecError> {
    shell_words::split(line).map_err(|e| ExecError::InvalidSpec {
        message: format!("cannot split `{}` into argv: {}", line, e),
    })
}

fn quote_cmd(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | '\\' | '='))
    {
        return token.to_string();
    }

    // Backslashes only need doubling when they precede a quote.
    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    let chars: Vec<char> = token.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => {
                let next_is_quote = chars.get(i + 1).map(|n| *n == '"').unwrap_or(true);
                if next_is_quote {
                    out.push_str("\\\\");
                } else {
                    out.push('\\');
                }
            }
            c => out.push(*c),
        }
    }
    out.push('"');
    out
}

/// Render an environment assignment prefix (`K=v K2=v2 `) safe to prepend to
/// a POSIX command string. Returns an empty string for an empty map.
pub fn env_prefix(env: &[(String, String)]) -> String {
    let mut prefix = String::new();
    for (key, value) in env {
        prefix.push_str(key);
        prefix.push('=');
        let quoted: Cow<'_, str> = shell_words::quote(value);
        prefix.push_str(&quoted);
        prefix.push(' ');
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_plain_token_unchanged() {
        assert_eq!(quote(ShellProfile::Posix, "hello"), "hello");
        assert_eq!(quote(ShellProfile::Posix, "/usr/bin/env"), "/usr/bin/env");
    }

    #[test]
    fn test_posix_quotes_spaces_and_specials() {
        assert_eq!(quote(ShellProfile::Posix, "two words"), "'two words'");
        assert_eq!(quote(ShellProfile::Posix, "a;b"), "'a;b'");
        assert_eq!(quote(ShellProfile::Posix, "$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_posix_round_trip() {
        let tokens = vec![
            "plain".to_string(),
            "with space".to_string(),
            "sin'gle".to_string(),
            "do\"uble".to_string(),
            "$HOME".to_string(),
            "semi;colon&&".to_string(),
            "".to_string(),
        ];
        let joined = join(ShellProfile::Posix, &tokens);
        assert_eq!(split(&joined).unwrap(), tokens);
    }

    #[test]
    fn test_join_preserves_argv_order() {
        let line = join(ShellProfile::Posix, ["echo", "a b", "c"]);
        assert_eq!(line, "echo 'a b' c");
    }

    #[test]
    fn test_split_rejects_unbalanced_quote() {
        assert!(split("echo 'oops").is_err());
    }

    #[test]
    fn test_cmd_quoting() {
        assert_eq!(quote(ShellProfile::Cmd, "plain.exe"), "plain.exe");
        assert_eq!(quote(ShellProfile::Cmd, "two words"), "\"two words\"");
        assert_eq!(quote(ShellProfile::Cmd, "say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn test_env_prefix() {
        let env = vec![
            ("FOO".to_string(), "bar".to_string()),
            ("MSG".to_string(), "hello world".to_string()),
        ];
        assert_eq!(env_prefix(&env), "FOO=bar MSG='hello world' ");
        assert_eq!(env_prefix(&[]), "");
    }
}
