// backuptool/src/engine/runner.rs
//! Subprocess execution with deadlines and service-account demotion.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::errors::{BackupError, Result};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands on behalf of the adapters.
///
/// A `None` timeout means unbounded; exceeding a set timeout surfaces as
/// [`BackupError::TimedOut`], never as a generic failure, so the caller can
/// direct the operator to re-trigger the operation.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &[String],
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput>;
}

/// Production runner executing commands as the unprivileged service account.
pub struct SystemRunner {
    service_uid: Option<u32>,
    service_gid: Option<u32>,
}

impl SystemRunner {
    pub fn new(service_uid: Option<u32>, service_gid: Option<u32>) -> Self {
        Self {
            service_uid,
            service_gid,
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        command: &[String],
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let (executable, args) = command
            .split_first()
            .ok_or_else(|| BackupError::Validation("empty command".to_string()))?;
        debug!("executing command: {}", command.join(" "));

        let mut builder = Command::new(executable);
        builder
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        builder.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        #[cfg(unix)]
        {
            if let Some(uid) = self.service_uid {
                builder.uid(uid);
            }
            if let Some(gid) = self.service_gid {
                builder.gid(gid);
            }
        }

        let mut child = builder.spawn()?;
        if let Some(data) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data).await?;
            }
        }

        let output = match timeout {
            Some(limit) => time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| BackupError::TimedOut)??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new(None, None);
        let output = runner
            .run(&["echo".to_string(), "hello".to_string()], None, None)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_system_runner_times_out() {
        let runner = SystemRunner::new(None, None);
        let result = runner
            .run(
                &["sleep".to_string(), "5".to_string()],
                None,
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(BackupError::TimedOut)));
    }

    #[tokio::test]
    async fn test_system_runner_forwards_stdin() {
        let runner = SystemRunner::new(None, None);
        let output = runner
            .run(&["cat".to_string()], Some(b"token\n"), None)
            .await
            .unwrap();
        assert_eq!(output.stdout, "token\n");
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let runner = SystemRunner::new(None, None);
        let result = runner.run(&[], None, None).await;
        assert!(matches!(result, Err(BackupError::Validation(_))));
    }
}
