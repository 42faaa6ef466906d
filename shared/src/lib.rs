//! Shared types and utilities for the detonation sandbox services

// Re-export common dependencies
pub use anyhow;
pub use chrono;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;
pub use uuid;

pub mod messaging;
pub mod observability;
pub mod types;

pub use types::error::SandboxError;

pub type Result<T> = std::result::Result<T, SandboxError>;
