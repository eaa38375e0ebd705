use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Couldn't spawn '{}'! {}", .0, .1)]
    Spawn(String, std::io::Error),
    #[error("'{}' didn't finish within {:?}!", .0, .1)]
    TimedOut(String, Duration),
    #[error("'{}' failed ({}): {}", .command, .status, .stderr)]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

impl CommandError {
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Runs external programs; swapped out in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<String, CommandError>;
}

/// Spawns real processes through [`run_command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommands;

#[async_trait]
impl CommandRunner for SystemCommands {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<String, CommandError> {
        run_command(program, args, timeout).await
    }
}

/// Runs `program` and returns its trimmed standard output.
pub async fn run_command(program: &str, args: &[String], timeout: Duration) -> Result<String, CommandError> {
    let printable = format!("{program} {}", args.join(" "));

    debug!("exec: {printable}");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, output)
        .await
        .map_err(|_| CommandError::TimedOut(printable.clone(), timeout))?
        .map_err(|error| CommandError::Spawn(printable.clone(), error))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();

        debug!("exec: {printable} => {stderr}");

        return Err(CommandError::Failed {
            command: printable,
            status: output.status.to_string(),
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}
