use thiserror::Error;

/// Failures while assembling the runtime (configuration, logging).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A host bridge the configuration requires was never injected.
    #[error("Missing host capability {capability}: {message}")]
    CapabilityMissing { capability: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
