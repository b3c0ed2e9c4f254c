//! Drain tool invocation
//!
//! Draining and labeling go through the kubectl binary rather than the API so
//! the controller inherits kubectl's eviction semantics (PodDisruptionBudgets,
//! daemonset handling) without reimplementing them. Exit status 0 is success.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SentinelError};

/// Abstract drain tool operations consumed by the controller
#[async_trait]
pub trait NodeDrain: Send + Sync {
    /// Drain the node, retrying failed attempts until the timeout elapses
    async fn drain(&self, node_name: &str, timeout: Duration, retry_interval: Duration)
        -> Result<()>;

    /// Apply a label to the node
    async fn label(&self, node_name: &str, key: &str, value: &str) -> Result<()>;
}

/// kubectl subprocess runner
pub struct KubectlRunner {
    path: String,
}

impl KubectlRunner {
    /// Create a runner for the kubectl binary at `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        debug!(command = %self.path, args = ?args, "invoking drain tool");
        let output = Command::new(&self.path)
            .args(args)
            .output()
            .await
            .map_err(|e| SentinelError::drain(format!("failed to invoke {}: {e}", self.path)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(SentinelError::drain(format!(
            "{} exited with {}: {stderr}",
            self.path, output.status
        )))
    }
}

#[async_trait]
impl NodeDrain for KubectlRunner {
    async fn drain(
        &self,
        node_name: &str,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let timeout_arg = format!("--timeout={}s", timeout.as_secs());
        loop {
            let result = self
                .run(&[
                    "drain",
                    node_name,
                    "--ignore-daemonsets",
                    "--delete-emptydir-data",
                    "--force",
                    &timeout_arg,
                ])
                .await;
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if Instant::now() + retry_interval >= deadline {
                return Err(SentinelError::drain(format!(
                    "drain of node {node_name} failed: {err}"
                )));
            }
            warn!(node = %node_name, error = %err, "node drain attempt failed, retrying");
            tokio::time::sleep(retry_interval).await;
        }
    }

    async fn label(&self, node_name: &str, key: &str, value: &str) -> Result<()> {
        let label_arg = format!("{key}={value}");
        self.run(&["label", "node", node_name, &label_arg, "--overwrite"])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_succeeds_on_zero_exit() {
        let runner = KubectlRunner::new("/bin/true");
        let result = runner
            .drain("node-1", Duration::from_secs(1), Duration::from_secs(1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_drain_fails_on_nonzero_exit() {
        let runner = KubectlRunner::new("/bin/false");
        let result = runner
            .drain("node-1", Duration::from_secs(0), Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_drain_fails_on_missing_binary() {
        let runner = KubectlRunner::new("/nonexistent/kubectl");
        let result = runner
            .drain("node-1", Duration::from_secs(0), Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_label_succeeds_on_zero_exit() {
        let runner = KubectlRunner::new("/bin/true");
        assert!(runner.label("node-1", "exclude", "true").await.is_ok());
    }
}
