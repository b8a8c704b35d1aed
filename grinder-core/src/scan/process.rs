//! Subprocess execution for scan engines

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
}

/// Spawns one external program
///
/// The child is started with `kill_on_drop`, so dropping the future returned
/// by [`CommandRunner::run`] (timeout, cancellation) kills the process.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: OsString,
}

impl CommandRunner {
    /// Creates a runner for `program`, resolved through `PATH` when relative
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Program this runner starts
    pub fn program(&self) -> &OsString {
        &self.program
    }

    /// Runs the program to completion
    ///
    /// A non-zero exit status is a [`Error::ScanFailure`] carrying the last
    /// line of standard error.
    pub async fn run(&self, args: &[OsString], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let program = self.program.to_string_lossy().into_owned();
        trace!(%program, ?args, "spawning");

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ScanFailure(format!("failed to start {}: {}", program, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            let detail = result
                .stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no error output")
                .trim()
                .to_string();
            return Err(Error::ScanFailure(match result.code {
                Some(code) => format!("{} exited with status {}: {}", program, code, detail),
                None => format!("{} terminated by signal: {}", program, detail),
            }));
        }

        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let runner = CommandRunner::new("sh");
        let output = runner.run(&args(&["-c", "echo hello"]), None).await.unwrap();
        assert_eq!(output.code, Some(0));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let runner = CommandRunner::new("cat");
        let output = runner.run(&[], Some(b"{\"ip\": \"203.0.113.7\"}")).await.unwrap();
        assert_eq!(output.stdout, "{\"ip\": \"203.0.113.7\"}");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_scan_failure() {
        let runner = CommandRunner::new("sh");
        let err = runner
            .run(&args(&["-c", "echo 'bad target' >&2; exit 3"]), None)
            .await
            .unwrap_err();
        match err {
            Error::ScanFailure(msg) => {
                assert!(msg.contains("status 3"));
                assert!(msg.contains("bad target"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = CommandRunner::new("grinder-no-such-program");
        let err = runner.run(&[], None).await.unwrap_err();
        assert!(matches!(err, Error::ScanFailure(_)));
    }

    #[tokio::test]
    async fn test_dropped_future_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 2; touch {}", marker.display());

        let runner = CommandRunner::new("sh");
        let result =
            tokio::time::timeout(Duration::from_millis(100), runner.run(&args(&["-c", &script]), None)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }
}
