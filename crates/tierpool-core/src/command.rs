//! External command execution with a dry-run switch.

use crate::{Result, TierError};
use tokio::process::Command;
use tracing::{debug, info};

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs provisioning and mount tools.
///
/// Every command line is logged. In dry-run mode mutating commands are only
/// logged and report empty success, while [`query`](Self::query) commands
/// (read-only, like `lsblk`) still run so that a dry run can plan against the
/// real hardware.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    dry_run: bool,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run a command that changes system state.
    pub async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let line = render(program, args);
        if self.dry_run {
            info!("[dry-run] {}", line);
            return Ok(CommandOutput::default());
        }
        info!("Running: {}", line);
        execute(program, args, &line).await
    }

    /// Run a read-only command, also in dry-run mode.
    pub async fn query(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let line = render(program, args);
        debug!("Querying: {}", line);
        execute(program, args, &line).await
    }
}

async fn execute(program: &str, args: &[String], line: &str) -> Result<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| TierError::Command {
            command: line.to_string(),
            message: format!("failed to execute: {}", e),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(TierError::Command {
            command: line.to_string(),
            message: format!("exit status {}: {}", code, stderr.trim()),
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.contains(char::is_whitespace) {
            line.push_str(&format!("{:?}", arg));
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Build an owned argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_does_not_execute() {
        let runner = CommandRunner::new(true);
        let output = runner
            .run("definitely-not-a-real-binary", &args(["--wipe"]))
            .await
            .unwrap();
        assert!(output.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_query_runs_in_dry_run() {
        let runner = CommandRunner::new(true);
        let output = runner.query("echo", &args(["hello"])).await.unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_failure_is_command_error() {
        let runner = CommandRunner::new(false);
        let err = runner.run("false", &[]).await.unwrap_err();
        assert!(matches!(err, TierError::Command { .. }));

        let err = runner
            .run("definitely-not-a-real-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TierError::Command { .. }));
    }

    #[test]
    fn test_render_quotes_whitespace() {
        assert_eq!(
            render("mkfs", &args(["-t", "ext4", "/dev/my disk"])),
            "mkfs -t ext4 \"/dev/my disk\""
        );
    }
}
