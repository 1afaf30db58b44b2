//! OAuth 2.0 Authorization Code + PKCE protocol helpers
//!
//! This module implements the wire side of RFC 6749 (OAuth 2.0) and RFC 7636
//! (PKCE) against endpoints discovered by the authority resolver.
//!
//! # Overview
//!
//! [`TokenClient`] handles:
//! - Building authorization URLs with a PKCE challenge and state
//! - Validating the redirect returned by the presenter
//! - Redeeming authorization codes
//! - Redeeming refresh tokens (single attempt; retry policy belongs to the
//!   acquisition state machine)
//!
//! # Error mapping
//!
//! | Token endpoint outcome | Error |
//! |---|---|
//! | transport failure, 5xx, 429 | [`AuthError::TransientNetworkError`] |
//! | `invalid_grant`, `interaction_required`, `consent_required`, `login_required` | [`AuthError::InvalidGrant`] |
//! | any other 4xx | [`AuthError::TokenEndpointError`] |
//!
//! # Security
//!
//! - Generates cryptographically secure random state and code verifier
//! - Validates state parameter to prevent CSRF attacks
//! - Never logs sensitive values (tokens, codes, verifiers)

use crate::error::{AuthError, Result};
use crate::types::{AuthorityMetadata, ScopeSet};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use core_runtime::config::ClientConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Token endpoint error codes that mean the grant can no longer be used
/// without the user.
const GRANT_REJECTED_CODES: &[&str] = &[
    "invalid_grant",
    "interaction_required",
    "consent_required",
    "login_required",
];

/// PKCE (Proof Key for Code Exchange) verifier.
///
/// Holds the code verifier and the state parameter for one interactive
/// attempt. Only the challenge derived from the verifier is sent with the
/// authorization request.
#[derive(Clone)]
pub struct PkceVerifier {
    verifier: String,
    state: String,
    nonce: String,
}

impl PkceVerifier {
    /// Create a new PKCE verifier with cryptographically secure random values.
    ///
    /// Generates a 32-byte code verifier plus a 16-byte state and nonce, all
    /// base64-url-encoded without padding.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();

        // 43 characters once encoded, within RFC 7636 bounds
        let mut verifier_bytes = [0u8; 32];
        rng.fill(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let mut state_bytes = [0u8; 16];
        rng.fill(&mut state_bytes);
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        let mut nonce_bytes = [0u8; 16];
        rng.fill(&mut nonce_bytes);
        let nonce = URL_SAFE_NO_PAD.encode(nonce_bytes);

        Self {
            verifier,
            state,
            nonce,
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// Value the ID token's `nonce` claim must echo.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// S256 challenge: BASE64URL(SHA256(code_verifier))
    pub fn challenge(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceVerifier")
            .field("verifier", &"[REDACTED]")
            .field("state", &self.state)
            .finish()
    }
}

/// Successful token endpoint response.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Granted scopes, when the server narrowed or widened the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct OAuthErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    suberror: Option<String>,
}

/// Protocol client for one registered application.
pub struct TokenClient {
    client: ClientConfig,
    http_client: Arc<dyn HttpClient>,
}

impl TokenClient {
    pub fn new(client: ClientConfig, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            http_client,
        }
    }

    pub fn client(&self) -> &ClientConfig {
        &self.client
    }

    /// Build the authorization URL for an interactive attempt.
    ///
    /// The reserved OIDC scopes are always requested alongside `scopes`.
    #[instrument(skip(self, metadata, verifier, login_hint), fields(client_id = %self.client.client_id))]
    pub fn build_authorization_url(
        &self,
        metadata: &AuthorityMetadata,
        scopes: &ScopeSet,
        login_hint: Option<&str>,
        verifier: &PkceVerifier,
    ) -> Result<String> {
        let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
            AuthError::DiscoveryError {
                authority: metadata.issuer.clone(),
                reason: format!("invalid authorization endpoint: {}", e),
            }
        })?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client.client_id);
            query.append_pair("redirect_uri", &self.client.redirect_uri);
            query.append_pair("response_type", "code");
            query.append_pair("response_mode", "query");
            query.append_pair("scope", &scopes.with_reserved().to_oauth_string());
            query.append_pair("state", verifier.state());
            query.append_pair("nonce", verifier.nonce());
            query.append_pair("code_challenge", &verifier.challenge());
            query.append_pair("code_challenge_method", "S256");
            match login_hint {
                Some(hint) => {
                    query.append_pair("login_hint", hint);
                }
                None => {
                    query.append_pair("prompt", "select_account");
                }
            }
        }

        debug!("Built authorization URL");
        Ok(url.to_string())
    }

    /// Validate the redirect captured by the presenter and extract the code.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidRedirect`] when the URL does not target the
    ///   configured redirect URI or carries no code
    /// - [`AuthError::UserCancelled`] for `access_denied` with a cancel subcode
    /// - [`AuthError::AuthorizationDenied`] for any other `error=` redirect
    /// - [`AuthError::StateMismatch`] when `state` is missing or different
    pub fn parse_redirect(&self, redirect_url: &str, verifier: &PkceVerifier) -> Result<String> {
        let redirect = Url::parse(redirect_url)
            .map_err(|e| AuthError::InvalidRedirect(format!("unparseable redirect: {}", e)))?;
        let expected = Url::parse(&self.client.redirect_uri).map_err(|e| {
            AuthError::InvalidRequest(format!("configured redirect URI is invalid: {}", e))
        })?;

        if redirect.scheme() != expected.scheme()
            || redirect.host_str() != expected.host_str()
            || redirect.port_or_known_default() != expected.port_or_known_default()
            || redirect.path().trim_end_matches('/') != expected.path().trim_end_matches('/')
        {
            return Err(AuthError::InvalidRedirect(
                "redirect does not match the configured redirect URI".to_string(),
            ));
        }

        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut error_description = None;
        let mut error_subcode = None;
        for (key, value) in redirect.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => error_description = Some(value.into_owned()),
                "error_subcode" => error_subcode = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            if error == "access_denied" && error_subcode.as_deref() == Some("cancel") {
                return Err(AuthError::UserCancelled);
            }
            warn!(error = %error, "Authorization endpoint returned an error");
            return Err(AuthError::AuthorizationDenied {
                error,
                description: error_description,
            });
        }

        if state.as_deref() != Some(verifier.state()) {
            warn!("Authorization response state mismatch");
            return Err(AuthError::StateMismatch);
        }

        code.filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::InvalidRedirect("redirect carries no code".to_string()))
    }

    /// Exchange an authorization code for tokens.
    #[instrument(skip(self, metadata, code, verifier), fields(client_id = %self.client.client_id))]
    pub async fn redeem_code(
        &self,
        metadata: &AuthorityMetadata,
        code: &str,
        verifier: &PkceVerifier,
        scopes: &ScopeSet,
        timeout: Duration,
    ) -> Result<TokenResponse> {
        let scope = scopes.with_reserved().to_oauth_string();
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.client.redirect_uri.as_str()),
            ("client_id", self.client.client_id.as_str()),
            ("code_verifier", verifier.verifier()),
            ("scope", scope.as_str()),
        ];
        if let Some(ref secret) = self.client.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        debug!("Exchanging authorization code for tokens");
        let response = self
            .post_token(&metadata.token_endpoint, &params, timeout)
            .await?;

        debug!(expires_in = response.expires_in, "Authorization code redeemed");
        Ok(response)
    }

    /// Redeem a refresh token. A single attempt; callers decide on retries.
    #[instrument(skip(self, metadata, refresh_token), fields(client_id = %self.client.client_id))]
    pub async fn refresh(
        &self,
        metadata: &AuthorityMetadata,
        refresh_token: &str,
        scopes: &ScopeSet,
        timeout: Duration,
    ) -> Result<TokenResponse> {
        let scope = scopes.with_reserved().to_oauth_string();
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client.client_id.as_str()),
            ("scope", scope.as_str()),
        ];
        if let Some(ref secret) = self.client.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        debug!("Refreshing access token");
        self.post_token(&metadata.token_endpoint, &params, timeout)
            .await
    }

    async fn post_token(
        &self,
        token_endpoint: &str,
        params: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<TokenResponse> {
        let request = HttpRequest::post_form(token_endpoint, params)
            .map_err(|e| AuthError::SerializationFailed(e.to_string()))?
            .timeout(timeout);

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(AuthError::from_transport)?;

        if response.is_success() {
            return response
                .json::<TokenResponse>()
                .map_err(|e| AuthError::SerializationFailed(format!("token response: {}", e)));
        }

        Err(classify_token_error(&response))
    }
}

fn classify_token_error(response: &HttpResponse) -> AuthError {
    let status = response.status;

    if response.is_retryable() {
        warn!(status = status, "Token endpoint unavailable");
        return AuthError::TransientNetworkError(format!("token endpoint returned {}", status));
    }

    let body: OAuthErrorResponse = response.json().unwrap_or_default();

    if GRANT_REJECTED_CODES.contains(&body.error.as_str()) {
        warn!(
            status = status,
            error = %body.error,
            suberror = ?body.suberror,
            "Token endpoint rejected the grant"
        );
        return AuthError::InvalidGrant(
            body.error_description
                .unwrap_or_else(|| body.error.clone()),
        );
    }

    warn!(status = status, error = %body.error, "Token request failed");
    AuthError::TokenEndpointError {
        status,
        error: if body.error.is_empty() {
            "unknown_error".to_string()
        } else {
            body.error
        },
        description: body.error_description,
    }
}
