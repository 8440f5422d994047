//! Local command execution for pastel-ops
//!
//! Handles execution of local programs:
//! - Plain invocations in the current environment
//! - Elevated invocations through `sudo` (password from config/keyring)
//! - Timeout per command
//! - Combined stdout/stderr captured for diagnostics on failure

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::errors::OpsError;

/// Program plus arguments, kept unquoted until it has to become a shell line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Quoted shell line, used for remote sessions and error reports
    pub fn to_shell(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// Runs local commands and returns trimmed stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<String, OpsError>;

    /// Same as `run`, with root privileges
    async fn run_elevated(&self, invocation: &Invocation) -> Result<String, OpsError>;
}

/// Runner backed by `tokio::process`
pub struct LocalRunner {
    timeout: Duration,
    elevation_password: Option<String>,
}

impl LocalRunner {
    pub fn new(timeout: Duration, elevation_password: Option<String>) -> Self {
        Self {
            timeout,
            elevation_password,
        }
    }

    async fn execute(
        &self,
        mut command: AsyncCommand,
        shown: String,
        stdin: Option<String>,
    ) -> Result<String, OpsError> {
        let start_time = Instant::now();
        debug!("Executing command: {} (timeout: {:?})", shown, self.timeout);

        command
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OpsError::NotFound(format!("executable for `{}`", shown)),
            _ => OpsError::Io(e),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OpsError::Command {
                command: shown.clone(),
                code: None,
                output: format!("timed out after {:?}", self.timeout),
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            "Command `{}` finished in {}ms with {:?}",
            shown,
            start_time.elapsed().as_millis(),
            output.status.code()
        );

        if output.status.success() {
            Ok(stdout.trim().to_string())
        } else {
            Err(OpsError::Command {
                command: shown,
                code: output.status.code(),
                output: combine_output(&stdout, &stderr),
            })
        }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String, OpsError> {
        let mut command = AsyncCommand::new(&invocation.program);
        command.args(&invocation.args);
        self.execute(command, invocation.to_shell(), None).await
    }

    async fn run_elevated(&self, invocation: &Invocation) -> Result<String, OpsError> {
        if running_as_root() {
            return self.run(invocation).await;
        }

        let mut command = AsyncCommand::new("sudo");
        let shown = format!("sudo {}", invocation.to_shell());
        match &self.elevation_password {
            Some(password) => {
                command.args(["-S", "-p", ""]);
                command.arg(&invocation.program).args(&invocation.args);
                self.execute(command, shown, Some(password.clone())).await
            }
            None => {
                command.arg("-n").arg(&invocation.program).args(&invocation.args);
                self.execute(command, shown, None).await
            }
        }
    }
}

/// Stdout followed by a labelled stderr block when there is one
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{}\nSTDERR:\n{}", stdout, stderr)
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
