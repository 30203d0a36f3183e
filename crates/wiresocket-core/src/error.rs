use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Unified error type for the core library
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Internal hardware/OS error: {0}")]
    Internal(String),

    #[error("Invalid configuration provided: {0}")]
    InvalidConfig(String),

    #[error("Failed to establish tunnel connection: {0}")]
    ConnectionFailed(String),

    #[error("Network error during data transfer: {0}")]
    Network(#[from] std::io::Error),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("VPN subnet exhausted")]
    SubnetExhausted,
}
