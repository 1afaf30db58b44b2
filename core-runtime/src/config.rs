//! # Core Configuration Module
//!
//! Provides configuration management for the authentication core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds the injected bridges and the settings that drive token
//! acquisition. It enforces fail-fast validation so a missing capability is
//! reported at startup rather than on the first sign-in.
//!
//! ## Required Dependencies
//!
//! - `HttpClient` - Discovery and token endpoint requests
//! - `SecureStore` - Token cache persistence
//!
//! ## Optional Dependencies
//!
//! - `UiPresenter` - Interactive sign-in (without it only silent acquisition works)
//! - `Clock` - Time source (defaults to `SystemClock`)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{ClientConfig, CoreConfig};
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .client(ClientConfig::new("my-client-id", "http://localhost:8400/callback"))
//!     .default_authority("https://login.microsoftonline.com/common")
//!     .http_client(Arc::new(MyHttpClient))
//!     .secure_store(Arc::new(MySecureStore))
//!     .presenter(Arc::new(BrowserPresenter))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::{ClientConfig, CoreConfig};
//!
//! // Fails: no HttpClient or SecureStore injected
//! let config = CoreConfig::builder()
//!     .client(ClientConfig::new("client", "http://localhost/callback"))
//!     .build()
//!     .expect("Should fail - missing required bridges");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, HttpClient, SecureStore, SystemClock, UiPresenter};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Authority used when a request does not name one.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/common";

/// Hosts trusted without further configuration.
pub const DEFAULT_KNOWN_HOSTS: &[&str] = &[
    "login.microsoftonline.com",
    "login.microsoftonline.us",
    "login.chinacloudapi.cn",
    "login.windows.net",
    "login.microsoft.com",
];

const ENV_CLIENT_ID: &str = "AUTH_CLIENT_ID";
const ENV_CLIENT_SECRET: &str = "AUTH_CLIENT_SECRET";
const ENV_REDIRECT_URI: &str = "AUTH_REDIRECT_URI";

/// Registered client application.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub client_id: String,
    /// Only set for confidential clients.
    pub client_secret: Option<String>,
    pub redirect_uri: String,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: redirect_uri.into(),
        }
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Reads `AUTH_CLIENT_ID`, `AUTH_REDIRECT_URI` and the optional
    /// `AUTH_CLIENT_SECRET` from the environment.
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var(ENV_CLIENT_ID)
            .map_err(|_| Error::Config(format!("{} is not set", ENV_CLIENT_ID)))?;
        let redirect_uri = std::env::var(ENV_REDIRECT_URI)
            .map_err(|_| Error::Config(format!("{} is not set", ENV_REDIRECT_URI)))?;
        let client_secret = std::env::var(ENV_CLIENT_SECRET)
            .ok()
            .filter(|s| !s.is_empty());

        let config = Self {
            client_id,
            client_secret,
            redirect_uri,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("Client id cannot be empty".to_string()));
        }

        let redirect = Url::parse(&self.redirect_uri).map_err(|e| {
            Error::Config(format!(
                "Redirect URI '{}' is not a valid URL: {}",
                self.redirect_uri, e
            ))
        })?;

        if redirect.fragment().is_some() {
            return Err(Error::Config(
                "Redirect URI must not contain a fragment".to_string(),
            ));
        }

        Ok(())
    }
}

/// Authority allow-list settings.
///
/// When `enabled`, only authorities whose host appears in `known_hosts` are
/// resolved. Disable it to talk to arbitrary OIDC providers; https is still
/// required either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityValidation {
    pub enabled: bool,
    pub known_hosts: Vec<String>,
}

impl Default for AuthorityValidation {
    fn default() -> Self {
        Self {
            enabled: true,
            known_hosts: DEFAULT_KNOWN_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl AuthorityValidation {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            known_hosts: Vec::new(),
        }
    }

    pub fn with_known_host(mut self, host: impl Into<String>) -> Self {
        self.known_hosts.push(host.into().to_ascii_lowercase());
        self
    }

    /// Whether `host` may be resolved under these settings.
    pub fn is_trusted_host(&self, host: &str) -> bool {
        !self.enabled
            || self
                .known_hosts
                .iter()
                .any(|known| known.eq_ignore_ascii_case(host))
    }
}

/// Timing knobs for the acquisition state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionSettings {
    /// Access tokens expiring within this window are treated as expired.
    pub refresh_buffer: Duration,
    /// Delay before the single retry of a transient refresh failure.
    pub refresh_retry_backoff: Duration,
    /// Network timeout for requests that do not carry their own.
    pub default_timeout: Duration,
    /// How long resolved authority metadata stays fresh. `None` keeps it
    /// until invalidated.
    pub metadata_ttl: Option<Duration>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(300),
            refresh_retry_backoff: Duration::from_millis(500),
            default_timeout: Duration::from_secs(30),
            metadata_ttl: None,
        }
    }
}

impl AcquisitionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(Error::Config(
                "Default timeout must be greater than 0".to_string(),
            ));
        }

        if self.refresh_retry_backoff > Duration::from_secs(60) {
            return Err(Error::Config(
                "Refresh retry backoff exceeds maximum of 60 seconds".to_string(),
            ));
        }

        if self.refresh_buffer > Duration::from_secs(3600) {
            return Err(Error::Config(
                "Refresh buffer exceeds maximum of 1 hour".to_string(),
            ));
        }

        if matches!(self.metadata_ttl, Some(ttl) if ttl.is_zero()) {
            return Err(Error::Config(
                "Metadata TTL must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Core configuration for the authentication core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    pub client: ClientConfig,

    /// Authority used when a request does not override it
    pub default_authority: String,

    pub authority_validation: AuthorityValidation,

    pub acquisition: AcquisitionSettings,

    /// HTTP client for discovery and token requests (required)
    pub http_client: Arc<dyn HttpClient>,

    /// Secure credential storage backing the token cache (required)
    pub secure_store: Arc<dyn SecureStore>,

    /// Interactive sign-in presenter (optional)
    pub presenter: Option<Arc<dyn UiPresenter>>,

    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("client", &self.client)
            .field("default_authority", &self.default_authority)
            .field("authority_validation", &self.authority_validation)
            .field("acquisition", &self.acquisition)
            .field("http_client", &"HttpClient { ... }")
            .field("secure_store", &"SecureStore { ... }")
            .field(
                "presenter",
                &self.presenter.as_ref().map(|_| "UiPresenter { ... }"),
            )
            .field("clock", &"Clock { ... }")
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Client id and redirect URI are usable
    /// - The default authority is an https URL
    /// - The default authority host is trusted when validation is enabled
    /// - Timing settings are within range
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;

        let authority = Url::parse(&self.default_authority).map_err(|e| {
            Error::Config(format!(
                "Default authority '{}' is not a valid URL: {}",
                self.default_authority, e
            ))
        })?;

        if authority.scheme() != "https" {
            return Err(Error::Config(format!(
                "Default authority must use https, got '{}'",
                authority.scheme()
            )));
        }

        let host = authority.host_str().unwrap_or_default();
        if !self.authority_validation.is_trusted_host(host) {
            return Err(Error::Config(format!(
                "Default authority host '{}' is not in the known hosts list. \
                 Add it with AuthorityValidation::with_known_host or disable validation.",
                host
            )));
        }

        if self.authority_validation.enabled && self.authority_validation.known_hosts.is_empty() {
            return Err(Error::Config(
                "Authority validation is enabled but no known hosts are configured".to_string(),
            ));
        }

        self.acquisition.validate()
    }

    pub fn supports_interaction(&self) -> bool {
        self.presenter.is_some()
    }
}

fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required for authority discovery and \
                 token endpoint requests. Inject a TLS-capable client for the host platform."
            .to_string(),
    }
}

fn secure_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SecureStore".to_string(),
        message: "SecureStore implementation is required for token cache persistence. \
                 Desktop: inject an OS keychain backed store. \
                 Mobile: inject platform-native secure storage (Keychain/Keystore)."
            .to_string(),
    }
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Call [`build()`](CoreConfigBuilder::build) once the client and the required
/// bridges are set.
#[derive(Default)]
pub struct CoreConfigBuilder {
    client: Option<ClientConfig>,
    default_authority: Option<String>,
    authority_validation: Option<AuthorityValidation>,
    acquisition: AcquisitionSettings,
    http_client: Option<Arc<dyn HttpClient>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    presenter: Option<Arc<dyn UiPresenter>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CoreConfigBuilder {
    /// Sets the registered client application (required).
    pub fn client(mut self, client: ClientConfig) -> Self {
        self.client = Some(client);
        self
    }

    /// Sets the default authority.
    ///
    /// Default: `https://login.microsoftonline.com/common`
    pub fn default_authority(mut self, authority: impl Into<String>) -> Self {
        self.default_authority = Some(authority.into());
        self
    }

    pub fn authority_validation(mut self, validation: AuthorityValidation) -> Self {
        self.authority_validation = Some(validation);
        self
    }

    pub fn acquisition(mut self, settings: AcquisitionSettings) -> Self {
        self.acquisition = settings;
        self
    }

    pub fn refresh_buffer(mut self, buffer: Duration) -> Self {
        self.acquisition.refresh_buffer = buffer;
        self
    }

    pub fn refresh_retry_backoff(mut self, backoff: Duration) -> Self {
        self.acquisition.refresh_retry_backoff = backoff;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition.default_timeout = timeout;
        self
    }

    pub fn metadata_ttl(mut self, ttl: Duration) -> Self {
        self.acquisition.metadata_ttl = Some(ttl);
        self
    }

    /// Sets the HTTP client implementation (required).
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the secure store implementation (required).
    ///
    /// Tokens are persisted through it; it must provide platform-appropriate
    /// protection (Keychain on macOS/iOS, Keystore on Android, DPAPI on Windows).
    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    pub fn presenter(mut self, presenter: Arc<dyn UiPresenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    /// Overrides the time source. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] when the client is missing or a value is invalid
    /// - [`Error::CapabilityMissing`] when a required bridge was not injected
    pub fn build(self) -> Result<CoreConfig> {
        let client = self.client.ok_or_else(|| {
            Error::Config(
                "Client configuration is required. Use ClientConfig::new or ClientConfig::from_env."
                    .to_string(),
            )
        })?;

        let http_client = self.http_client.ok_or_else(http_client_missing_error)?;
        let secure_store = self.secure_store.ok_or_else(secure_store_missing_error)?;

        let config = CoreConfig {
            client,
            default_authority: self
                .default_authority
                .unwrap_or_else(|| DEFAULT_AUTHORITY.to_string()),
            authority_validation: self.authority_validation.unwrap_or_default(),
            acquisition: self.acquisition,
            http_client,
            secure_store,
            presenter: self.presenter,
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>),
        };

        config.validate()?;
        Ok(config)
    }
}
