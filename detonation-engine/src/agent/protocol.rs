//! Wire messages exchanged with the in-guest agent.
//!
//! Encoded as newline-delimited JSON; every request expects exactly one
//! response.

use serde::{Deserialize, Serialize};

use crate::models::report::{ArtifactManifest, BehaviorEvent};

/// Host-to-guest requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum AgentRequest {
    /// Open the session and negotiate a protocol version
    Handshake { version: u32 },
    /// Push a named blob into the guest; the agent echoes the checksum it
    /// computed over the received bytes
    Transfer {
        name: String,
        bytes: Vec<u8>,
        checksum: String,
    },
    /// Detonate the sample under the named analysis package
    Execute { package: String },
    /// Liveness probe; also drains buffered behavior events
    Heartbeat,
    /// Ask the guest to wind down. Safe to repeat.
    Terminate,
}

/// Guest-to-host responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum AgentResponse {
    HandshakeAck {
        version: u32,
    },
    TransferAck {
        checksum: String,
    },
    Started,
    /// Still running; carries behavior observed since the last poll
    Pulse {
        events: Vec<BehaviorEvent>,
        log: Vec<String>,
    },
    /// Run finished; final observations plus the artifact listing
    Completion {
        manifest: ArtifactManifest,
        events: Vec<BehaviorEvent>,
        log: Vec<String>,
    },
    Terminated,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = AgentRequest::Handshake { version: 3 };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "Handshake");
        assert_eq!(json["body"]["version"], 3);
    }

    #[test]
    fn test_response_round_trip() {
        let response = AgentResponse::TransferAck {
            checksum: "abc123".to_string(),
        };
        let line = serde_json::to_string(&response).unwrap();
        let parsed: AgentResponse = serde_json::from_str(&line).unwrap();
        match parsed {
            AgentResponse::TransferAck { checksum } => assert_eq!(checksum, "abc123"),
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
