//! Interactive Sign-In Presentation
//!
//! The only nondeterministic step of token acquisition is the user: the
//! authorization page is shown by the host (system browser, web view,
//! authentication session) and the core waits for the redirect.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// What the host must show to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPrompt {
    /// Fully built authorization URL (PKCE challenge, state, scopes included)
    pub authorization_url: String,
    /// Redirect URI the identity provider will navigate to on completion
    pub redirect_uri: String,
}

/// Result of presenting the authorization page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterOutcome {
    /// The provider redirected back; carries the full redirect URL
    /// including the query string.
    Redirected(String),
    /// The user dismissed the sign-in UI.
    Cancelled,
}

/// Host-provided UI presenter.
///
/// # Cancellation
///
/// The core races `present` against the request's cancellation token and
/// stops awaiting as soon as it fires. Implementations receive the same
/// token so they can dismiss the UI they opened.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::presenter::{AuthorizationPrompt, PresenterOutcome, UiPresenter};
///
/// struct BrowserPresenter;
///
/// #[async_trait::async_trait]
/// impl UiPresenter for BrowserPresenter {
///     async fn present(
///         &self,
///         prompt: AuthorizationPrompt,
///         cancel: CancellationToken,
///     ) -> Result<PresenterOutcome> {
///         open::that(&prompt.authorization_url)?;
///         let redirect = wait_for_loopback(&prompt.redirect_uri, cancel).await?;
///         Ok(PresenterOutcome::Redirected(redirect))
///     }
/// }
/// ```
#[async_trait]
pub trait UiPresenter: Send + Sync {
    /// Show the authorization page and wait for the redirect or dismissal.
    async fn present(
        &self,
        prompt: AuthorizationPrompt,
        cancel: CancellationToken,
    ) -> Result<PresenterOutcome>;
}
