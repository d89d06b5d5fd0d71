//! Thin wrapper over `tokio::process::Command` shared by every driver that
//! shells out to `ip`/`wg`/`wg-quick`/`ping`.

use thiserror::Error;
use tokio::process::Command;

use std::future::Future;
use std::io;
use std::process::Output;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command exited with a non-zero status")]
    CommandFailed,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Whether a failing/noisy command should be logged or silently tolerated.
/// `Suppress` is used for idempotent "delete if present" calls.
#[derive(Debug, Clone, Copy)]
pub enum Logs {
    Print,
    Suppress,
}

pub trait ShellCommandExt {
    fn run(&mut self, logs: Logs) -> impl Future<Output = Result<(), Error>> + Send;
    fn run_stdout(&mut self, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
}

impl ShellCommandExt for Command {
    async fn run(&mut self, logs: Logs) -> Result<(), Error> {
        let output = self.output().await?;
        stdout_from_output(format!("{:?}", self), output, logs).map(|_| ())
    }

    async fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output().await?;
        stdout_from_output(format!("{:?}", self), output, logs)
    }
}

pub fn stdout_from_output(cmd: String, output: Output, logs: Logs) -> Result<String, Error> {
    let stderr_empty = output.stderr.is_empty();
    let stdout = String::from_utf8_lossy(&output.stdout);
    match (stderr_empty, output.status) {
        (true, status) if status.success() => Ok(stdout.trim().to_string()),
        (false, status) if status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if matches!(logs, Logs::Print) {
                tracing::warn!(cmd, %stderr, "non-empty stderr on successful command");
            }
            Ok(stdout.trim().to_string())
        }
        (_, status) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if matches!(logs, Logs::Print) {
                tracing::error!(cmd, status_code = ?status.code(), %stdout, %stderr, "command failed");
            }
            Err(Error::CommandFailed)
        }
    }
}
