use thiserror::Error;

/// Error reported by a host bridge implementation.
///
/// Messages end up in core errors and logs, so they must not embed secrets.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The platform cannot provide this capability right now (no keychain,
    /// no browser, offline).
    #[error("Host capability unavailable: {0}")]
    NotAvailable(String),

    #[error("Host operation failed: {0}")]
    OperationFailed(String),

    #[error("Host operation timed out: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
