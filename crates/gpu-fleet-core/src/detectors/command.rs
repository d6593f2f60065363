//! Process execution seam for the vendor tools

use async_trait::async_trait;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, Result};

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs vendor tools
#[async_trait]
pub trait CommandRunner: Send + Sync + Debug {
    /// Run to completion; a non-zero exit is returned as output, not an error
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Whether `program` can be found
    async fn exists(&self, program: &str) -> bool;

    /// Run, fail on non-zero exit, and give up early when `cancel` fires
    async fn run_checked(&self, cancel: &CancellationToken, program: &str, args: &[&str]) -> Result<String> {
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FleetError::Cancelled),
            output = self.run(program, args) => output?,
        };
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(FleetError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                message: first_line(&output.stderr)
                    .or_else(|| first_line(&output.stdout))
                    .unwrap_or_else(|| format!("exit code {:?}", output.exit_code)),
            })
        }
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Executes commands on the local host
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let command_line = format!("{} {}", program, args.join(" "));
        tracing::debug!(command = %command_line, "Running vendor tool");

        let child = Command::new(program).args(args).kill_on_drop(true).output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| FleetError::CommandFailed {
                command: command_line.clone(),
                message: format!("timed out after {}ms", self.timeout.as_millis()),
            })?
            .map_err(|e| FleetError::CommandFailed {
                command: command_line,
                message: e.to_string(),
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    async fn exists(&self, program: &str) -> bool {
        if program.contains(std::path::MAIN_SEPARATOR) {
            return Path::new(program).is_file();
        }
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    }
}

/// Replays canned tool output, keyed by the full command line
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    installed: std::collections::HashSet<String>,
    outputs: std::sync::RwLock<std::collections::HashMap<String, CommandOutput>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a program as present on the host
    pub fn installed(mut self, program: &str) -> Self {
        self.installed.insert(program.to_string());
        self
    }

    /// Succeed with `stdout` for exactly this command line
    pub fn respond(self, command_line: &str, stdout: &str) -> Self {
        self.set(
            command_line,
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(0),
            },
        );
        self
    }

    /// Fail with `stderr` for exactly this command line
    pub fn fail(self, command_line: &str, stderr: &str) -> Self {
        self.set(
            command_line,
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code: Some(1),
            },
        );
        self
    }

    /// Replace the output of a command line at runtime
    pub fn set(&self, command_line: &str, output: CommandOutput) {
        if let Ok(mut outputs) = self.outputs.write() {
            outputs.insert(command_line.to_string(), output);
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let command_line = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        let scripted = self
            .outputs
            .read()
            .ok()
            .and_then(|outputs| outputs.get(&command_line).cloned());
        Ok(scripted.unwrap_or_else(|| CommandOutput {
            stdout: String::new(),
            stderr: format!("no scripted output for `{}`", command_line),
            exit_code: Some(127),
        }))
    }

    async fn exists(&self, program: &str) -> bool {
        self.installed.contains(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_checks_exit_code() {
        let runner = ScriptedCommandRunner::new()
            .installed("nvidia-smi")
            .respond("nvidia-smi -L", "GPU 0: NVIDIA L4 (UUID: GPU-1)\n")
            .fail("nvidia-smi -q", "NVML: driver mismatch");
        let cancel = CancellationToken::new();

        assert!(runner.exists("nvidia-smi").await);
        assert!(runner.run_checked(&cancel, "nvidia-smi", &["-L"]).await.unwrap().contains("GPU 0"));
        match runner.run_checked(&cancel, "nvidia-smi", &["-q"]).await {
            Err(FleetError::CommandFailed { message, .. }) => assert_eq!(message, "NVML: driver mismatch"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_run() {
        let runner = ScriptedCommandRunner::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            runner.run_checked(&cancel, "rocm-smi", &[]).await,
            Err(FleetError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let runner = SystemCommandRunner::new(Duration::from_secs(1));
        assert!(!runner.exists("definitely-not-a-vendor-tool-xyz").await);
        assert!(runner.run("definitely-not-a-vendor-tool-xyz", &[]).await.is_err());
    }

    #[test]
    fn test_first_line_skips_blank() {
        assert_eq!(first_line("\n  \nNVML not found\nmore"), Some("NVML not found".into()));
        assert_eq!(first_line("   "), None);
    }
}
