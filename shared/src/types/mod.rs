pub mod error;

pub use error::SandboxError;
