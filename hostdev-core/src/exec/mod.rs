//! Command execution seam.
//!
//! SR-IOV toggling goes through a vendor management binary rather than
//! plain sysfs writes, so the engines run it through this trait and
//! tests substitute a recorder.

use crate::error::{HostdevError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion and return its stdout. A nonzero
    /// exit status is an error carrying stderr.
    async fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>>;
}

/// Runs commands directly on the host.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        debug!(cmd = %cmd, ?args, "running command");
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| HostdevError::CommandFailed {
                command: cmd.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(HostdevError::CommandFailed {
                command: cmd.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Runs commands inside a pod on this node via `kubectl exec`. Used when
/// the management binary ships in a driver container instead of on the
/// host image.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    namespace: String,
    pod_name: String,
}

impl RemoteExecutor {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), pod_name: pod_name.into() }
    }
}

#[async_trait]
impl CommandExecutor for RemoteExecutor {
    async fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        let command_line = std::iter::once(cmd)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(pod = %self.pod_name, cmd = %command_line, "running command in pod");
        LocalExecutor
            .run(
                "kubectl",
                &[
                    "exec",
                    "-n",
                    &self.namespace,
                    &self.pod_name,
                    "--",
                    "sh",
                    "-c",
                    &command_line,
                ],
            )
            .await
    }
}
