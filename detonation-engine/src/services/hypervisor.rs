use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use shared::SandboxError;

/// Control surface of the virtualization layer. Each call is synchronous
/// with a success/failure result; no VM internals leak past this trait.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Power on a machine
    async fn start_machine(&self, machine_id: &str) -> Result<(), SandboxError>;

    /// Force power-off, used when a guest ignores graceful termination
    async fn stop_machine(&self, machine_id: &str) -> Result<(), SandboxError>;

    /// Restore a machine to its baseline snapshot
    async fn revert_snapshot(&self, machine_id: &str, snapshot: &str) -> Result<(), SandboxError>;
}

/// Shells out to the configured hypervisor control binary
/// (`<bin> start|poweroff|revert <machine> [snapshot]`).
pub struct ShellHypervisor {
    control_bin: String,
}

impl ShellHypervisor {
    pub fn new(control_bin: impl Into<String>) -> Self {
        Self {
            control_bin: control_bin.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(), SandboxError> {
        debug!(bin = %self.control_bin, ?args, "Invoking hypervisor control");

        let output = Command::new(&self.control_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| SandboxError::Hypervisor(format!("{} failed to spawn: {}", self.control_bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(?args, %stderr, "Hypervisor control returned non-zero");
            return Err(SandboxError::Hypervisor(format!(
                "{} {} failed: {}",
                self.control_bin,
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl HypervisorClient for ShellHypervisor {
    async fn start_machine(&self, machine_id: &str) -> Result<(), SandboxError> {
        self.run(&["start", machine_id]).await
    }

    async fn stop_machine(&self, machine_id: &str) -> Result<(), SandboxError> {
        self.run(&["poweroff", machine_id]).await
    }

    async fn revert_snapshot(&self, machine_id: &str, snapshot: &str) -> Result<(), SandboxError> {
        self.run(&["revert", machine_id, snapshot]).await
    }
}
