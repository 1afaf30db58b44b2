//! # Host Bridge Traits
//!
//! The token-acquisition core never opens a socket, touches the platform
//! credential vault or shows a window itself. It is handed implementations of
//! the traits below by the host application, and tests hand it scripted fakes.
//!
//! | Trait | Used for |
//! |-------|----------|
//! | [`HttpClient`](http::HttpClient) | OIDC discovery and token endpoint calls |
//! | [`SecureStore`](storage::SecureStore) | Persisting token cache partitions |
//! | [`UiPresenter`](presenter::UiPresenter) | Showing the authorization page, returning the redirect |
//! | [`Clock`](time::Clock) | Expiry decisions |
//! | [`LoggerSink`](time::LoggerSink) | Mirroring redacted logs into the host pipeline |
//!
//! Every trait is `Send + Sync`; one instance serves all concurrent
//! acquisitions. Failures are reported as [`BridgeError`] and are mapped onto
//! the core's own error taxonomy (a transport error becomes a transient
//! network error, a storage error becomes secure-storage-unavailable).
//!
//! ```ignore
//! use async_trait::async_trait;
//! use bridge_traits::error::{BridgeError, Result};
//! use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
//!
//! pub struct ReqwestTransport(reqwest::Client);
//!
//! #[async_trait]
//! impl HttpClient for ReqwestTransport {
//!     async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
//!         let response = self.0.execute(to_reqwest(request)?).await
//!             .map_err(|e| BridgeError::OperationFailed(e.to_string()))?;
//!         from_reqwest(response).await
//!     }
//! }
//! ```

pub mod error;
pub mod http;
pub mod presenter;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use presenter::{AuthorizationPrompt, PresenterOutcome, UiPresenter};
pub use storage::SecureStore;
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
