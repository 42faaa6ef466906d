use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use shared::SandboxError;

use crate::models::machine::MachineSpec;
use crate::agent::protocol::{AgentRequest, AgentResponse};

/// One request/response exchange with the guest agent. Implementations own
/// framing and I/O deadlines; callers own the protocol sequence.
#[async_trait]
pub trait AgentTransport: Send {
    async fn call(&mut self, request: AgentRequest) -> Result<AgentResponse, SandboxError>;
}

/// Opens a transport to the agent inside an allocated machine
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, machine: &MachineSpec) -> Result<Box<dyn AgentTransport>, SandboxError>;
}

/// Newline-delimited JSON over TCP to a fixed guest port
pub struct TcpAgentTransport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    call_timeout: Duration,
}

#[async_trait]
impl AgentTransport for TcpAgentTransport {
    async fn call(&mut self, request: AgentRequest) -> Result<AgentResponse, SandboxError> {
        let mut line = serde_json::to_string(&request)
            .map_err(|e| SandboxError::Internal(format!("encode agent request: {}", e)))?;
        line.push('\n');

        timeout(self.call_timeout, self.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| SandboxError::AgentUnreachable("write deadline elapsed".to_string()))?
            .map_err(|e| SandboxError::AgentUnreachable(format!("write failed: {}", e)))?;

        let mut response_line = String::new();
        let read = timeout(self.call_timeout, self.reader.read_line(&mut response_line))
            .await
            .map_err(|_| SandboxError::AgentUnreachable("response deadline elapsed".to_string()))?
            .map_err(|e| SandboxError::AgentUnreachable(format!("read failed: {}", e)))?;

        if read == 0 {
            return Err(SandboxError::AgentUnreachable(
                "connection closed by guest".to_string(),
            ));
        }

        serde_json::from_str(&response_line)
            .map_err(|e| SandboxError::AgentUnreachable(format!("malformed response: {}", e)))
    }
}

/// Connects to `<guest_addr>:<port>` of the leased machine
pub struct TcpAgentConnector {
    port: u16,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl TcpAgentConnector {
    pub fn new(port: u16, connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            call_timeout,
        }
    }
}

#[async_trait]
impl AgentConnector for TcpAgentConnector {
    async fn connect(&self, machine: &MachineSpec) -> Result<Box<dyn AgentTransport>, SandboxError> {
        let addr = format!("{}:{}", machine.guest_addr, self.port);
        debug!(machine_id = %machine.id, %addr, "Connecting to guest agent");

        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                SandboxError::AgentUnreachable(format!("connect to {} timed out", addr))
            })?
            .map_err(|e| SandboxError::AgentUnreachable(format!("connect to {}: {}", addr, e)))?;

        let (read_half, write_half) = stream.into_split();

        Ok(Box::new(TcpAgentTransport {
            reader: BufReader::new(read_half),
            writer: write_half,
            call_timeout: self.call_timeout,
        }))
    }
}
