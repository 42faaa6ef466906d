use std::time::Instant;

use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use shared::SandboxError;

use crate::agent::protocol::{AgentRequest, AgentResponse};
use crate::agent::transport::{AgentConnector, AgentTransport};
use crate::config::AgentConfig;
use crate::models::machine::MachineSpec;
use crate::models::report::{ArtifactManifest, BehaviorEvent};
use crate::utils::sha256_hex;

/// Result of one heartbeat poll
#[derive(Debug)]
pub enum PollResult {
    Running {
        events: Vec<BehaviorEvent>,
        log: Vec<String>,
    },
    Completed {
        manifest: ArtifactManifest,
        events: Vec<BehaviorEvent>,
        log: Vec<String>,
    },
}

/// Ephemeral per-task control channel to the in-guest agent.
///
/// Never outlives its task or its machine lease; the supervisor drops it
/// during teardown.
pub struct AgentSession {
    transport: Box<dyn AgentTransport>,
    pub session_id: Uuid,
    pub negotiated_version: u32,
    last_contact: Instant,
    terminated: bool,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("session_id", &self.session_id)
            .field("negotiated_version", &self.negotiated_version)
            .field("last_contact", &self.last_contact)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl AgentSession {
    /// Handshake with protocol-version negotiation, bounded by the
    /// configured handshake deadline.
    pub async fn open(
        connector: &dyn AgentConnector,
        machine: &MachineSpec,
        config: &AgentConfig,
    ) -> Result<Self, SandboxError> {
        let deadline = config.handshake_deadline();

        let mut transport = timeout(deadline, connector.connect(machine))
            .await
            .map_err(|_| {
                SandboxError::AgentUnreachable(format!(
                    "no agent on {} within handshake deadline",
                    machine.id
                ))
            })??;

        let response = timeout(
            deadline,
            transport.call(AgentRequest::Handshake {
                version: config.protocol_version,
            }),
        )
        .await
        .map_err(|_| SandboxError::AgentUnreachable("handshake deadline elapsed".to_string()))??;

        let negotiated_version = match response {
            AgentResponse::HandshakeAck { version }
                if version >= config.min_protocol_version
                    && version <= config.protocol_version =>
            {
                version
            }
            AgentResponse::HandshakeAck { version } => {
                return Err(SandboxError::AgentUnreachable(format!(
                    "agent protocol version {} outside supported range {}..={}",
                    version, config.min_protocol_version, config.protocol_version
                )));
            }
            other => return Err(unexpected(other, "HandshakeAck")),
        };

        let session_id = Uuid::new_v4();
        debug!(%session_id, machine_id = %machine.id, negotiated_version, "Agent session opened");

        Ok(Self {
            transport,
            session_id,
            negotiated_version,
            last_contact: Instant::now(),
            terminated: false,
        })
    }

    /// Push a blob into the guest, verifying the agent received exactly
    /// the bytes we sent.
    pub async fn transfer(&mut self, name: &str, bytes: Vec<u8>) -> Result<(), SandboxError> {
        let checksum = sha256_hex(&bytes);

        let response = self
            .transport
            .call(AgentRequest::Transfer {
                name: name.to_string(),
                bytes,
                checksum: checksum.clone(),
            })
            .await?;
        self.last_contact = Instant::now();

        match response {
            AgentResponse::TransferAck { checksum: echoed } if echoed == checksum => Ok(()),
            AgentResponse::TransferAck { checksum: echoed } => {
                Err(SandboxError::TransferIntegrity {
                    expected: checksum,
                    actual: echoed,
                })
            }
            other => Err(unexpected(other, "TransferAck")),
        }
    }

    pub async fn execute(&mut self, package: &str) -> Result<(), SandboxError> {
        let response = self
            .transport
            .call(AgentRequest::Execute {
                package: package.to_string(),
            })
            .await?;
        self.last_contact = Instant::now();

        match response {
            AgentResponse::Started => Ok(()),
            other => Err(unexpected(other, "Started")),
        }
    }

    /// Heartbeat probe; drains behavior observed since the last poll.
    pub async fn poll(&mut self) -> Result<PollResult, SandboxError> {
        let response = self.transport.call(AgentRequest::Heartbeat).await?;
        self.last_contact = Instant::now();

        match response {
            AgentResponse::Pulse { events, log } => Ok(PollResult::Running { events, log }),
            AgentResponse::Completion {
                manifest,
                events,
                log,
            } => Ok(PollResult::Completed {
                manifest,
                events,
                log,
            }),
            other => Err(unexpected(other, "Pulse or Completion")),
        }
    }

    /// Elapsed time since the agent last answered anything
    pub fn silence(&self) -> std::time::Duration {
        self.last_contact.elapsed()
    }

    /// Graceful shutdown request. Idempotent: repeated calls after a
    /// confirmed termination are no-ops. Returns whether the guest
    /// confirmed the session closed.
    pub async fn terminate(&mut self) -> Result<bool, SandboxError> {
        if self.terminated {
            return Ok(true);
        }

        match self.transport.call(AgentRequest::Terminate).await {
            Ok(AgentResponse::Terminated) => {
                self.terminated = true;
                Ok(true)
            }
            Ok(other) => {
                warn!(session_id = %self.session_id, ?other, "Unexpected terminate response");
                Ok(false)
            }
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "Terminate went unanswered");
                Ok(false)
            }
        }
    }
}

fn unexpected(response: AgentResponse, wanted: &str) -> SandboxError {
    match response {
        AgentResponse::Error { message } => {
            SandboxError::AgentUnreachable(format!("agent error: {}", message))
        }
        other => SandboxError::AgentUnreachable(format!(
            "expected {}, got {:?}",
            wanted, other
        )),
    }
}
