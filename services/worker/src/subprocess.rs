//! Subprocess execution with merged output and a wall-clock timeout.
//!
//! Provisioning and build steps shell out to the imagebuilder's build
//! rules. Their stdout and stderr are captured in memory and persisted as
//! a failure log when a step goes wrong. Builds that hang are killed at
//! the configured timeout instead of wedging the worker forever.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from subprocess execution.
#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("subprocess exceeded {0:?} wall-clock timeout")]
    Timeout(Duration),
}

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    /// Whether the process exited zero.
    pub success: bool,

    /// stdout followed by stderr.
    pub output: Vec<u8>,
}

/// Run a command to completion, capturing stdout and stderr.
///
/// `env` entries are set on top of the inherited environment;
/// `env_remove` entries are cleared from it.
pub async fn run(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &[(&str, &str)],
    env_remove: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, SubprocessError> {
    debug!(program, ?args, cwd = %cwd.display(), "Running subprocess");

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }
    for key in env_remove {
        command.env_remove(key);
    }

    let child = command.spawn().map_err(|source| SubprocessError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
    let output = match result {
        Ok(output) => output?,
        // kill_on_drop reaps the hung process when the future is dropped.
        Err(_) => return Err(SubprocessError::Timeout(timeout)),
    };

    let mut merged = output.stdout;
    merged.extend_from_slice(&output.stderr);
    Ok(CommandOutput {
        success: output.status.success(),
        output: merged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_status() {
        let out = run(
            "sh",
            &["-c".to_string(), "echo out; echo err 1>&2".to_string()],
            Path::new("."),
            &[],
            &[],
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(out.success);
        let text = String::from_utf8(out.output).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let out = run(
            "sh",
            &["-c".to_string(), "exit 3".to_string()],
            Path::new("."),
            &[],
            &[],
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn environment_is_applied() {
        let out = run(
            "sh",
            &["-c".to_string(), "echo ${NO_UPDATE:-unset}".to_string()],
            Path::new("."),
            &[("NO_UPDATE", "1")],
            &[],
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(String::from_utf8(out.output).unwrap().contains('1'));
    }

    #[tokio::test]
    async fn hung_subprocess_times_out() {
        let err = run(
            "sleep",
            &["30".to_string()],
            Path::new("."),
            &[],
            &[],
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubprocessError::Timeout(_)));
    }
}
