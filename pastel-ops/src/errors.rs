//! Error taxonomy shared by every pastel-ops component
//!
//! Each variant carries enough context (command line, captured output, step
//! name) to diagnose a failure without re-running with more verbosity.

/// Errors produced by runners, sessions, service managers and orchestrators
#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("command `{command}` failed (exit code {code:?}): {output}")]
    Command {
        command: String,
        code: Option<i32>,
        output: String,
    },
    #[error("unexpected output from `{command}`: {detail}")]
    Parse { command: String, detail: String },
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("{what} did not succeed after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },
    #[error("aborted by operator")]
    OperatorAbort,
    #[error("interrupted by signal")]
    Interrupted,
    #[error("unsupported platform: {0}")]
    Unsupported(String),
    #[error("step `{step}` failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<OpsError>,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl OpsError {
    /// Attach the name of the orchestration step that produced this error
    pub fn at_step(self, step: &'static str) -> Self {
        OpsError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// Innermost error under any step wrappers
    pub fn root_cause(&self) -> &OpsError {
        match self {
            OpsError::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Operator declined a confirmation; callers treat it as a clean exit
    pub fn is_operator_abort(&self) -> bool {
        match self {
            OpsError::OperatorAbort => true,
            OpsError::Step { source, .. } => source.is_operator_abort(),
            _ => false,
        }
    }

    /// The command line that failed, if this error came from one
    pub fn failed_command(&self) -> Option<&str> {
        match self {
            OpsError::Command { command, .. } | OpsError::Parse { command, .. } => Some(command),
            OpsError::Step { source, .. } => source.failed_command(),
            _ => None,
        }
    }

    /// Captured output of a failed command (exit status was non-zero)
    pub fn command_output(&self) -> Option<&str> {
        match self {
            OpsError::Command { output, .. } => Some(output),
            OpsError::Step { source, .. } => source.command_output(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_wrapping_keeps_abort_and_command() {
        let err = OpsError::Command {
            command: "pastel-cli getinfo".to_string(),
            code: Some(1),
            output: "error: couldn't connect".to_string(),
        }
        .at_step("wait-remote-live");

        assert_eq!(err.failed_command(), Some("pastel-cli getinfo"));
        assert_eq!(err.command_output(), Some("error: couldn't connect"));
        assert!(err.to_string().contains("wait-remote-live"));
        assert!(!err.is_operator_abort());

        assert!(OpsError::OperatorAbort.at_step("prepare-masternode").is_operator_abort());
    }
}
