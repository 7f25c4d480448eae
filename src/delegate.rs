//! External search delegate
//!
//! Hands a bounded sub-range to a specialized scanner (a keyhunt-compatible
//! binary in rmd160 mode) and parses its stdout for a success marker and a
//! hex key. A failing tool is reported as `DelegateOutcome::Failed` and never
//! aborts the search. Keys reported by the tool are not trusted: callers
//! re-verify them against the oracle.

use crate::config::DelegateConfig;
use crate::error::{Result, SearchError};
use crate::range::{Key, SearchRange};
use crate::target::SearchTarget;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Lines after the marker line that may still carry the key
const KEY_LOOKAHEAD_LINES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateOutcome {
    Found(Key),
    NotFound,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ExternalDelegate {
    program: PathBuf,
    marker: String,
    threads: usize,
    extra_args: Vec<String>,
}

impl ExternalDelegate {
    /// Locate the configured program on `PATH` (or at its literal path).
    pub fn resolve(config: &DelegateConfig) -> Result<Self> {
        let program = which::which(&config.program).map_err(|e| {
            SearchError::Delegate(format!("{} not found: {}", config.program, e))
        })?;
        if config.marker.is_empty() {
            return Err(SearchError::InvalidConfig("delegate.marker must not be empty".into()));
        }
        Ok(Self {
            program,
            marker: config.marker.clone(),
            threads: config.threads.max(1),
            extra_args: config.extra_args.clone(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, target: &SearchTarget, range: SearchRange) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-m")
            .arg("rmd160")
            .arg("-f")
            .arg(target.fingerprint().as_str())
            .arg("-s")
            .arg(format!("{:#x}", range.lower()))
            .arg("-e")
            .arg(format!("{:#x}", range.upper()))
            .arg("-t")
            .arg(self.threads.to_string())
            .args(&self.extra_args)
            .stdin(Stdio::null());
        cmd
    }

    /// Run the tool over `range` and wait for it to exit.
    pub fn run(&self, target: &SearchTarget, range: SearchRange) -> DelegateOutcome {
        info!(program = %self.program.display(), range = %range, threads = self.threads, "delegating range");
        let output = match self.command(target, range).output() {
            Ok(output) => output,
            Err(e) => {
                warn!(program = %self.program.display(), error = %e, "delegate failed to start");
                return DelegateOutcome::Failed(e.to_string());
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = format!("exit status {:?}: {}", output.status.code(), stderr.trim());
            warn!(range = %range, %reason, "delegate exited unsuccessfully");
            return DelegateOutcome::Failed(reason);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_delegate_output(&stdout, &self.marker) {
            Some(key) => DelegateOutcome::Found(key),
            None if stdout.contains(&self.marker) => {
                warn!(range = %range, "delegate reported success without a readable key");
                DelegateOutcome::Failed("success marker without a key".into())
            }
            None => DelegateOutcome::NotFound,
        }
    }
}

/// Extract the key reported next to the first `marker` occurrence.
///
/// A `0x`-prefixed token wins; otherwise the last bare hex token holding at
/// least one decimal digit. The marker's own line is searched first, then
/// a few lines after it.
pub fn parse_delegate_output(text: &str, marker: &str) -> Option<Key> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().position(|line| line.contains(marker))?;
    lines[start..]
        .iter()
        .take(KEY_LOOKAHEAD_LINES + 1)
        .find_map(|line| key_in_line(&line.replace(marker, " ")))
}

fn key_in_line(line: &str) -> Option<Key> {
    let tokens: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || matches!(c, ':' | '=' | ',' | '[' | ']' | '(' | ')'))
        .filter(|token| !token.is_empty())
        .collect();

    let prefixed = tokens.iter().find_map(|token| {
        let digits = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X"))?;
        parse_hex(digits)
    });
    prefixed.or_else(|| {
        tokens
            .iter()
            .rev()
            .filter(|token| token.bytes().any(|b| b.is_ascii_digit()))
            .find_map(|token| parse_hex(token))
    })
}

fn parse_hex(digits: &str) -> Option<Key> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Key::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefixed_key_on_marker_line() {
        let out = "scanning...\nFOUND key: 0x0000000000000000000000000000000000000000000000040000000000000abc\n";
        assert_eq!(parse_delegate_output(out, "FOUND"), Some((4u128 << 64) | 0xabc));
    }

    #[test]
    fn test_parse_key_on_following_line() {
        let out = "worker FOUND a hit\nPrivate Key = 1f2e\nbye";
        assert_eq!(parse_delegate_output(out, "FOUND"), Some(0x1f2e));
    }

    #[test]
    fn test_parse_without_marker_is_none() {
        assert_eq!(parse_delegate_output("Private key: 0x1234", "FOUND"), None);
        assert_eq!(parse_delegate_output("", "FOUND"), None);
    }

    #[test]
    fn test_parse_ignores_words_and_oversized_values() {
        assert_eq!(parse_delegate_output("FOUND add bead face", "FOUND"), None);
        let huge = format!("FOUND 0x1{}", "0".repeat(40));
        assert_eq!(parse_delegate_output(&huge, "FOUND"), None);
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let config = DelegateConfig {
            program: "definitely-not-a-real-scanner-binary".into(),
            ..DelegateConfig::default()
        };
        assert!(matches!(ExternalDelegate::resolve(&config), Err(SearchError::Delegate(_))));
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("scanner.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_run_parses_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "echo \"range $6..$8 threads ${10}\"\necho \"FOUND: 0x2a\"");
        let config = DelegateConfig {
            program: program.display().to_string(),
            threads: 2,
            ..DelegateConfig::default()
        };
        let delegate = ExternalDelegate::resolve(&config).unwrap();
        let target = SearchTarget::new("751e76e8199196d454941c45d1b3a323f1433bd6", 8).unwrap();
        let outcome = delegate.run(&target, SearchRange::new(0x10, 0x40).unwrap());
        assert_eq!(outcome, DelegateOutcome::Found(0x2a));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "echo boom >&2\nexit 3");
        let config = DelegateConfig {
            program: program.display().to_string(),
            ..DelegateConfig::default()
        };
        let delegate = ExternalDelegate::resolve(&config).unwrap();
        let target = SearchTarget::new("751e76e8199196d454941c45d1b3a323f1433bd6", 8).unwrap();
        match delegate.run(&target, SearchRange::new(1, 2).unwrap()) {
            DelegateOutcome::Failed(reason) => assert!(reason.contains("boom")),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
