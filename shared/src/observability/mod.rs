pub mod logging;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type ObservabilityResult<T> = std::result::Result<T, ObservabilityError>;
