use bridge_traits::BridgeError;
use thiserror::Error;

/// Errors surfaced by token acquisition.
///
/// `Clone` so a single in-flight result can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No cached credential matches the request")]
    CacheMiss,

    #[error("User interaction is required: {0}")]
    InteractionRequired(String),

    #[error("User cancelled the sign-in")]
    UserCancelled,

    #[error("Operation was cancelled")]
    OperationCancelled,

    #[error("Transient network error: {0}")]
    TransientNetworkError(String),

    #[error("Untrusted authority: {0}")]
    UntrustedAuthority(String),

    #[error("Authority discovery failed for {authority}: {reason}")]
    DiscoveryError { authority: String, reason: String },

    #[error("Refresh token is expired or revoked: {0}")]
    InvalidGrant(String),

    #[error("Token endpoint returned {status}: {error}")]
    TokenEndpointError {
        status: u16,
        error: String,
        description: Option<String>,
    },

    #[error("Authorization denied: {error}")]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("Authorization response state did not match the request")]
    StateMismatch,

    #[error("Invalid redirect: {0}")]
    InvalidRedirect(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid ID token: {0}")]
    InvalidIdToken(String),

    #[error("Operation timed out: {operation} (after {timeout_ms}ms)")]
    OperationTimeout { operation: String, timeout_ms: u64 },

    #[error("Secure storage unavailable: {0}")]
    SecureStorageUnavailable(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },
}

impl AuthError {
    /// Failures worth retrying once during refresh.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthError::TransientNetworkError(_) | AuthError::OperationTimeout { .. }
        )
    }

    /// Whether the caller can reasonably recover, either by retrying or by
    /// switching to interactive acquisition.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AuthError::CacheMiss
                | AuthError::InteractionRequired(_)
                | AuthError::TransientNetworkError(_)
                | AuthError::InvalidGrant(_)
                | AuthError::OperationTimeout { .. }
        )
    }

    /// Maps a transport failure. Every transport-level failure is treated as
    /// transient; HTTP status handling happens on the response.
    pub(crate) fn from_transport(err: BridgeError) -> Self {
        AuthError::TransientNetworkError(err.to_string())
    }

    pub(crate) fn from_storage(err: BridgeError) -> Self {
        AuthError::SecureStorageUnavailable(err.to_string())
    }
}

impl From<core_runtime::Error> for AuthError {
    fn from(err: core_runtime::Error) -> Self {
        match err {
            core_runtime::Error::CapabilityMissing {
                capability,
                message,
            } => AuthError::CapabilityMissing {
                capability,
                message,
            },
            other => AuthError::InvalidRequest(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::SerializationFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
