use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::SandboxError;

/// Handle to one task's running capture
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    pub task_id: Uuid,
    pub pcap_path: PathBuf,
}

/// Per-task network traffic recording, scoped to one machine's interface
#[async_trait]
pub trait CaptureClient: Send + Sync {
    async fn start_capture(
        &self,
        task_id: Uuid,
        interface: &str,
    ) -> Result<CaptureHandle, SandboxError>;

    /// Stop the capture and return the recording's path
    async fn stop_capture(&self, handle: CaptureHandle) -> Result<PathBuf, SandboxError>;
}

/// Drives a tcpdump process per task
pub struct TcpdumpCapture {
    binary: String,
    output_dir: PathBuf,
    children: Mutex<HashMap<Uuid, Child>>,
}

impl TcpdumpCapture {
    pub fn new(binary: impl Into<String>, output_dir: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| SandboxError::Capture(format!("capture dir: {}", e)))?;
        Ok(Self {
            binary: binary.into(),
            output_dir,
            children: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl CaptureClient for TcpdumpCapture {
    async fn start_capture(
        &self,
        task_id: Uuid,
        interface: &str,
    ) -> Result<CaptureHandle, SandboxError> {
        let pcap_path = self.output_dir.join(format!("{}.pcap", task_id));

        let child = Command::new(&self.binary)
            .arg("-i")
            .arg(interface)
            .arg("-w")
            .arg(&pcap_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Capture(format!("{} failed to spawn: {}", self.binary, e)))?;

        info!(%task_id, %interface, path = ?pcap_path, "Packet capture started");
        self.children.lock().await.insert(task_id, child);

        Ok(CaptureHandle { task_id, pcap_path })
    }

    async fn stop_capture(&self, handle: CaptureHandle) -> Result<PathBuf, SandboxError> {
        let child = self.children.lock().await.remove(&handle.task_id);

        match child {
            Some(mut child) => {
                if let Err(e) = child.start_kill() {
                    warn!(task_id = %handle.task_id, error = %e, "Failed to signal capture process");
                }
                // Bounded wait so a wedged tcpdump cannot stall teardown
                match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(task_id = %handle.task_id, ?status, "Capture process exited")
                    }
                    Ok(Err(e)) => warn!(task_id = %handle.task_id, error = %e, "Capture wait failed"),
                    Err(_) => warn!(task_id = %handle.task_id, "Capture process did not exit in time"),
                }
                Ok(handle.pcap_path)
            }
            None => Err(SandboxError::Capture(format!(
                "no active capture for task {}",
                handle.task_id
            ))),
        }
    }
}
