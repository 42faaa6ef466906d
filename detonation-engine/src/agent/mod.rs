//! Control channel between the host supervisor and the in-guest agent.
//!
//! The contract is fixed: handshake, checksum-verified transfer, execute,
//! heartbeat polling, completion and idempotent terminate, each bounded by
//! a deadline. The transport is an implementation detail behind
//! [`AgentTransport`].

pub mod packages;
pub mod protocol;
pub mod session;
pub mod transport;

pub use protocol::{AgentRequest, AgentResponse};
pub use session::{AgentSession, PollResult};
pub use transport::{AgentConnector, AgentTransport, TcpAgentConnector};
