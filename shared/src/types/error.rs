//! Common error types for the detonation sandbox

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("No idle machine available for platform '{0}'")]
    NoCapacity(String),

    #[error("Agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("Transfer integrity check failed: expected {expected}, got {actual}")]
    TransferIntegrity { expected: String, actual: String },

    #[error("Hypervisor operation failed: {0}")]
    Hypervisor(String),

    #[error("Packet capture failed: {0}")]
    Capture(String),

    #[error("Machine {0} is cordoned pending health recovery")]
    MachineFaulted(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Infrastructure faults: the machine or its control channel misbehaved,
    /// not the submitted sample. These drive the scheduler's bounded retry.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SandboxError::AgentUnreachable(_)
                | SandboxError::TransferIntegrity { .. }
                | SandboxError::Hypervisor(_)
                | SandboxError::Capture(_)
                | SandboxError::MachineFaulted(_)
        )
    }

    /// Transient conditions that clear on their own and need no operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SandboxError::NoCapacity(_)
                | SandboxError::Timeout(_)
                | SandboxError::ExternalService(_)
        )
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_classification() {
        assert!(SandboxError::AgentUnreachable("no handshake".to_string()).is_infrastructure());
        assert!(SandboxError::Hypervisor("revert failed".to_string()).is_infrastructure());
        assert!(SandboxError::TransferIntegrity {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        }
        .is_infrastructure());
        assert!(!SandboxError::InvalidTask("missing platform".to_string()).is_infrastructure());
        assert!(!SandboxError::Timeout("poll".to_string()).is_infrastructure());
    }

    #[test]
    fn test_transient_classification() {
        assert!(SandboxError::NoCapacity("linux-x64".to_string()).is_transient());
        assert!(SandboxError::ExternalService("intel down".to_string()).is_transient());
        assert!(!SandboxError::MachineFaulted("vm-01".to_string()).is_transient());
    }
}
