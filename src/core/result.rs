//! Immutable record of one finished run

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::spec::Encoding;

/// Outcome of a completed run.
///
/// Produced by the run supervisor once the process has terminated and all
/// captured output has been drained. With `nothrow` in effect a non-zero
/// exit lands here instead of in an error; `ok()` reports which case this
/// is.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,

    /// Name of the signal that terminated the process, if any
    pub signal: Option<String>,

    stdout: Bytes,
    stderr: Bytes,

    pub started_at: DateTime<Utc>,
    pub duration: Duration,

    /// Target description, e.g. `ssh://deploy@web1:22 (auth: private-key)`
    pub target: String,

    /// Sanitized command text
    pub command: String,

    encoding: Encoding,
}

impl ExecResult {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        exit_code: i32,
        signal: Option<String>,
        stdout: Bytes,
        stderr: Bytes,
        started_at: DateTime<Utc>,
        duration: Duration,
        target: String,
        command: String,
        encoding: Encoding,
    ) -> Self {
        Self {
            exit_code,
            signal,
            stdout,
            stderr,
            started_at,
            duration,
            target,
            command,
            encoding,
        }
    }

    /// True when the process exited zero.
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_bytes(&self) -> &Bytes {
        &self.stdout
    }

    pub fn stderr_bytes(&self) -> &Bytes {
        &self.stderr
    }

    /// Captured stdout decoded per the run's encoding (lossy UTF-8).
    pub fn stdout(&self) -> String {
        decode(&self.stdout, self.encoding)
    }

    /// Captured stderr decoded per the run's encoding (lossy UTF-8).
    pub fn stderr(&self) -> String {
        decode(&self.stderr, self.encoding)
    }

    /// Stdout with trailing newline trimmed; the common scripting accessor.
    pub fn text(&self) -> String {
        let mut s = self.stdout();
        while s.ends_with('\n') || s.ends_with('\r') {
            s.pop();
        }
        s
    }
}

fn decode(bytes: &Bytes, encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        // Raw runs still get a best-effort text view for diagnostics.
        Encoding::Raw => String::from_utf8_lossy(bytes).into_owned(),
    }
}

impl std::fmt::Display for ExecResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "`{}` on {}: exit {} in {:?}",
            self.command, self.target, self.exit_code, self.duration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stdout: &'static [u8], code: i32) -> ExecResult {
        ExecResult::new(
            code,
            None,
            Bytes::from_static(stdout),
            Bytes::new(),
            Utc::now(),
            Duration::from_millis(3),
            "local".to_string(),
            "echo hello".to_string(),
            Encoding::Utf8,
        )
    }

    #[test]
    fn test_ok_tracks_exit_code() {
        assert!(result(b"hello\n", 0).ok());
        assert!(!result(b"", 7).ok());
    }

    #[test]
    fn test_text_trims_trailing_newlines() {
        assert_eq!(result(b"hello\n", 0).text(), "hello");
        assert_eq!(result(b"hello\r\n", 0).text(), "hello");
        assert_eq!(result(b"a\nb\n", 0).text(), "a\nb");
        assert_eq!(result(b"hello\n", 0).stdout(), "hello\n");
    }

    #[test]
    fn test_lossy_decoding() {
        assert_eq!(result(&[0xff, b'o', b'k'], 0).stdout(), "\u{fffd}ok");
    }
}
