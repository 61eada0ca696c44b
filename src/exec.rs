//! Thin wrapper around external command execution.
//!
//! The iproute2 and iptables adapters go through [`CommandRunner`] so their
//! argument lists and output parsing can be exercised without a real host.

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

#[cfg(test)]
use mockall::automock;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    #[cfg(test)]
    pub fn ok(stdout: &str) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[cfg(test)]
    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// A non-zero exit is not an error here; callers decide what it means.
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the local host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommand;

#[async_trait]
impl CommandRunner for SystemCommand {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        debug!("exec: {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Render a command line for error messages.
pub fn display_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}
