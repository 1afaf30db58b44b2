//! # Acquisition State Machine
//!
//! Drives a single token request through
//!
//! ```text
//! Idle -> CacheLookup -> Hit ----------------------------> Done
//!                     -> Miss -> Refresh -> Success -----> Done
//!                                        -> Expired/Revoked -> Interactive
//! Interactive -> UserApproved -> Done
//!             -> UserCancelled -> Cancelled
//!             -> Error -> Failed
//! ```
//!
//! Given the cache contents and the token endpoint's answers the machine is
//! deterministic. The only other input is the user, reached through
//! [`UiPresenter::present`], which is always raced against the request's
//! cancellation token.
//!
//! ## Policies
//!
//! - `Silent` never reaches `Interactive`: it fails with
//!   [`AuthError::InteractionRequired`], or with the transient error itself
//!   when the token endpoint stayed unreachable.
//! - `Auto` falls through to `Interactive`.
//! - `Interactive` skips cache lookup and refresh. `force_refresh` skips only
//!   the cache hit.
//!
//! A transient refresh failure (transport error, 5xx, 429, timeout) is retried
//! exactly once after the configured backoff. Every transition is recorded in
//! an [`AcquisitionTrace`].

use crate::authority::AuthorityResolver;
use crate::error::{AuthError, Result};
use crate::id_token::{ClientInfo, IdTokenClaims};
use crate::oauth::{PkceVerifier, TokenClient, TokenResponse};
use crate::token_cache::{CacheLookup, TokenCache};
use crate::types::{
    AcquisitionRequest, Account, AuthenticationResult, Authority, AuthorityMetadata,
    Credential, CredentialKind, InteractionPolicy, ScopeSet, TokenSource,
};
use bridge_traits::presenter::{AuthorizationPrompt, PresenterOutcome, UiPresenter};
use bridge_traits::time::Clock;
use bridge_traits::BridgeError;
use chrono::Duration as ChronoDuration;
use core_runtime::config::AcquisitionSettings;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    CacheLookup,
    Refresh,
    Interactive,
    Done,
    Cancelled,
    Failed,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcquisitionState::Idle => "idle",
            AcquisitionState::CacheLookup => "cache_lookup",
            AcquisitionState::Refresh => "refresh",
            AcquisitionState::Interactive => "interactive",
            AcquisitionState::Done => "done",
            AcquisitionState::Cancelled => "cancelled",
            AcquisitionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: AcquisitionState,
    pub to: AcquisitionState,
    pub detail: String,
}

/// Transitions taken by one acquisition, for diagnostics.
#[derive(Debug, Clone)]
pub struct AcquisitionTrace {
    correlation_id: Uuid,
    current: AcquisitionState,
    transitions: Vec<Transition>,
    refresh_attempts: u32,
}

impl AcquisitionTrace {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            current: AcquisitionState::Idle,
            transitions: Vec::new(),
            refresh_attempts: 0,
        }
    }

    fn transition(&mut self, to: AcquisitionState, detail: impl Into<String>) {
        let detail = detail.into();
        debug!(
            correlation_id = %self.correlation_id,
            from = %self.current,
            to = %to,
            detail = %detail,
            "Acquisition transition"
        );
        self.transitions.push(Transition {
            from: self.current,
            to,
            detail,
        });
        self.current = to;
    }

    pub fn current(&self) -> AcquisitionState {
        self.current
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Visited states in order, starting with `Idle`.
    pub fn states(&self) -> Vec<AcquisitionState> {
        std::iter::once(AcquisitionState::Idle)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }

    pub fn visited(&self, state: AcquisitionState) -> bool {
        self.states().contains(&state)
    }

    /// Number of token endpoint calls made with a refresh token.
    pub fn refresh_attempts(&self) -> u32 {
        self.refresh_attempts
    }
}

/// Result of running the machine, with the path it took.
#[derive(Debug, Clone)]
pub struct AcquisitionOutcome {
    pub result: Result<AuthenticationResult>,
    pub trace: AcquisitionTrace,
}

enum SilentOutcome {
    Done(AuthenticationResult),
    NeedsInteraction(String),
}

/// Collaborators the machine runs against.
pub struct AcquisitionStateMachine {
    cache: TokenCache,
    resolver: Arc<AuthorityResolver>,
    token_client: Arc<TokenClient>,
    presenter: Option<Arc<dyn UiPresenter>>,
    clock: Arc<dyn Clock>,
    settings: AcquisitionSettings,
    default_authority: String,
    event_bus: EventBus,
}

impl AcquisitionStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: TokenCache,
        resolver: Arc<AuthorityResolver>,
        token_client: Arc<TokenClient>,
        presenter: Option<Arc<dyn UiPresenter>>,
        clock: Arc<dyn Clock>,
        settings: AcquisitionSettings,
        default_authority: impl Into<String>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            cache,
            resolver,
            token_client,
            presenter,
            clock,
            settings,
            default_authority: default_authority.into(),
            event_bus,
        }
    }

    pub fn default_authority(&self) -> &str {
        &self.default_authority
    }

    /// Normalized authority a request will run against.
    pub fn authority_for(&self, request: &AcquisitionRequest) -> Result<Authority> {
        self.resolver.validate(
            request
                .authority
                .as_deref()
                .unwrap_or(&self.default_authority),
        )
    }

    /// Runs `request` to a terminal state.
    #[instrument(skip(self, request), fields(correlation_id = %request.correlation_id, policy = ?request.policy))]
    pub async fn run(&self, request: &AcquisitionRequest) -> AcquisitionOutcome {
        let mut trace = AcquisitionTrace::new(request.correlation_id);
        let result = self.drive(request, &mut trace).await;

        match &result {
            Ok(auth) => {
                trace.transition(AcquisitionState::Done, auth.source.to_string());
            }
            Err(err @ (AuthError::UserCancelled | AuthError::OperationCancelled)) => {
                trace.transition(AcquisitionState::Cancelled, err.to_string());
            }
            Err(err) => {
                if let AuthError::InteractionRequired(reason) = err {
                    self.emit(AuthEvent::InteractionRequired {
                        correlation_id: request.correlation_id.to_string(),
                        reason: reason.clone(),
                    });
                }
                self.emit(AuthEvent::AuthError {
                    correlation_id: Some(request.correlation_id.to_string()),
                    message: err.to_string(),
                    recoverable: err.is_recoverable(),
                });
                warn!(error = %err, "Token acquisition failed");
                trace.transition(AcquisitionState::Failed, err.to_string());
            }
        }

        AcquisitionOutcome { result, trace }
    }

    async fn drive(
        &self,
        request: &AcquisitionRequest,
        trace: &mut AcquisitionTrace,
    ) -> Result<AuthenticationResult> {
        request.validate()?;
        if request.cancel.is_cancelled() {
            return Err(AuthError::OperationCancelled);
        }

        let authority = self.authority_for(request)?;
        let scopes = request.scopes.without_reserved();
        let timeout = request.timeout.unwrap_or(self.settings.default_timeout);

        let (reason, known_account) = if request.policy == InteractionPolicy::Interactive {
            ("interactive policy".to_string(), None)
        } else {
            trace.transition(AcquisitionState::CacheLookup, "");
            let account = self.resolve_account(request, &authority).await?;
            match account {
                None => ("no cached account matches the request".to_string(), None),
                Some(account) => {
                    match self
                        .silent(request, &authority, &scopes, &account, timeout, trace)
                        .await?
                    {
                        SilentOutcome::Done(result) => return Ok(result),
                        SilentOutcome::NeedsInteraction(reason) => (reason, Some(account)),
                    }
                }
            }
        };

        if request.policy == InteractionPolicy::Silent {
            return Err(AuthError::InteractionRequired(reason));
        }

        trace.transition(AcquisitionState::Interactive, reason);
        self.interactive(request, &authority, &scopes, known_account.as_ref(), timeout)
            .await
    }

    async fn resolve_account(
        &self,
        request: &AcquisitionRequest,
        authority: &Authority,
    ) -> Result<Option<Account>> {
        if let Some(ref id) = request.account {
            let account = self.cache.account(id).await?.unwrap_or_else(|| Account {
                id: id.clone(),
                username: request.login_hint.clone().unwrap_or_default(),
                display_name: None,
                home_authority: authority.as_str().to_string(),
                tenant_id: None,
            });
            return Ok(Some(account));
        }

        match request.login_hint {
            Some(ref hint) => self.cache.find_account_by_username(hint).await,
            None => Ok(None),
        }
    }

    async fn silent(
        &self,
        request: &AcquisitionRequest,
        authority: &Authority,
        scopes: &ScopeSet,
        account: &Account,
        timeout: Duration,
        trace: &mut AcquisitionTrace,
    ) -> Result<SilentOutcome> {
        if !request.force_refresh {
            if let CacheLookup::Hit(token) = self.cache.lookup(&account.id, authority, scopes).await? {
                self.emit(AuthEvent::CacheHit {
                    correlation_id: request.correlation_id.to_string(),
                    account_id: account.id.to_string(),
                });
                let id_token = self.cache.id_token(&account.id, authority).await?;
                return Ok(SilentOutcome::Done(AuthenticationResult {
                    access_token: token,
                    id_token,
                    account: account.clone(),
                    source: TokenSource::Cache,
                    correlation_id: request.correlation_id,
                }));
            }
        }

        trace.transition(
            AcquisitionState::Refresh,
            if request.force_refresh { "force refresh" } else { "cache miss" },
        );

        let Some(refresh_token) = self.cache.refresh_token(&account.id, authority).await? else {
            return Ok(SilentOutcome::NeedsInteraction(
                "no refresh token cached".to_string(),
            ));
        };

        let metadata = self.metadata(authority, &request.cancel, timeout).await?;

        self.emit(AuthEvent::TokenRefreshing {
            correlation_id: request.correlation_id.to_string(),
            account_id: account.id.to_string(),
        });

        let mut retried = false;
        loop {
            trace.refresh_attempts += 1;
            let attempt = guarded(
                &request.cancel,
                "token refresh",
                timeout,
                self.token_client
                    .refresh(&metadata, refresh_token.secret(), scopes, timeout),
            )
            .await;

            match attempt {
                Ok(response) => {
                    let result = self
                        .complete(
                            response,
                            TokenSource::Refresh,
                            request,
                            authority,
                            &metadata,
                            scopes,
                            Some(account),
                        )
                        .await?;
                    self.emit(AuthEvent::TokenRefreshed {
                        correlation_id: request.correlation_id.to_string(),
                        account_id: result.account.id.to_string(),
                        expires_at: result.expires_at().map(|t| t.timestamp()).unwrap_or_default(),
                    });
                    info!(account_id = %result.account.id, "Access token refreshed");
                    return Ok(SilentOutcome::Done(result));
                }
                Err(AuthError::InvalidGrant(reason)) => {
                    warn!(account_id = %account.id, "Refresh token rejected");
                    self.cache.remove_refresh_token(&account.id, authority).await?;
                    return Ok(SilentOutcome::NeedsInteraction(format!(
                        "refresh token rejected: {}",
                        reason
                    )));
                }
                Err(err) if err.is_transient() && !retried => {
                    retried = true;
                    warn!(
                        error = %err,
                        backoff_ms = self.settings.refresh_retry_backoff.as_millis() as u64,
                        "Transient refresh failure, retrying once"
                    );
                    tokio::select! {
                        biased;
                        _ = request.cancel.cancelled() => return Err(AuthError::OperationCancelled),
                        _ = tokio::time::sleep(self.settings.refresh_retry_backoff) => {}
                    }
                }
                Err(err) if err.is_transient() => {
                    if request.policy == InteractionPolicy::Silent {
                        return Err(err);
                    }
                    return Ok(SilentOutcome::NeedsInteraction(format!(
                        "token endpoint unreachable: {}",
                        err
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn interactive(
        &self,
        request: &AcquisitionRequest,
        authority: &Authority,
        scopes: &ScopeSet,
        known_account: Option<&Account>,
        timeout: Duration,
    ) -> Result<AuthenticationResult> {
        let presenter = self.presenter.as_ref().ok_or_else(|| AuthError::CapabilityMissing {
            capability: "UiPresenter".to_string(),
            message: "interactive acquisition requires a UiPresenter".to_string(),
        })?;

        let metadata = self.metadata(authority, &request.cancel, timeout).await?;
        let verifier = PkceVerifier::new();
        let login_hint = request
            .login_hint
            .clone()
            .or_else(|| known_account.map(|a| a.username.clone()))
            .filter(|hint| !hint.is_empty());

        let authorization_url = self.token_client.build_authorization_url(
            &metadata,
            scopes,
            login_hint.as_deref(),
            &verifier,
        )?;

        self.emit(AuthEvent::InteractionStarted {
            correlation_id: request.correlation_id.to_string(),
        });

        let prompt = AuthorizationPrompt {
            authorization_url,
            redirect_uri: self.token_client.client().redirect_uri.clone(),
        };

        let outcome = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(AuthError::OperationCancelled),
            outcome = presenter.present(prompt, request.cancel.child_token()) => outcome,
        };

        let redirect = match outcome.map_err(presenter_error)? {
            PresenterOutcome::Redirected(redirect) => redirect,
            PresenterOutcome::Cancelled => return Err(AuthError::UserCancelled),
        };

        let code = self.token_client.parse_redirect(&redirect, &verifier)?;
        let response = guarded(
            &request.cancel,
            "authorization code redemption",
            timeout,
            self.token_client
                .redeem_code(&metadata, &code, &verifier, scopes, timeout),
        )
        .await?;

        if let Some(raw) = response.id_token.as_deref() {
            IdTokenClaims::decode(raw)?.verify_nonce(verifier.nonce())?;
        }

        let result = self
            .complete(
                response,
                TokenSource::Interactive,
                request,
                authority,
                &metadata,
                scopes,
                known_account,
            )
            .await?;

        self.emit(AuthEvent::SignedIn {
            account_id: result.account.id.to_string(),
            authority: authority.as_str().to_string(),
        });
        info!(account_id = %result.account.id, "Interactive sign-in completed");
        Ok(result)
    }

    async fn metadata(
        &self,
        authority: &Authority,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<AuthorityMetadata> {
        guarded(
            cancel,
            "authority discovery",
            timeout,
            self.resolver.resolve(authority.as_str()),
        )
        .await
    }

    /// Turns a token response into cached credentials and a result.
    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        response: TokenResponse,
        source: TokenSource,
        request: &AcquisitionRequest,
        authority: &Authority,
        metadata: &AuthorityMetadata,
        requested: &ScopeSet,
        known_account: Option<&Account>,
    ) -> Result<AuthenticationResult> {
        let now = self.clock.now();

        let client_info = response
            .client_info
            .as_deref()
            .and_then(|raw| ClientInfo::decode(raw).ok());
        let claims = response
            .id_token
            .as_deref()
            .map(IdTokenClaims::decode)
            .transpose()?;

        if let Some(ref claims) = claims {
            if !claims.issuer_matches(&metadata.issuer) {
                warn!(
                    token_issuer = %claims.iss,
                    advertised_issuer = %metadata.issuer,
                    "ID token issuer does not match authority metadata"
                );
                self.resolver.invalidate(authority.as_str());
                return Err(AuthError::InvalidIdToken(format!(
                    "issuer {} does not match the authority",
                    claims.iss
                )));
            }
        }

        let account = match (&claims, known_account) {
            (Some(claims), _) => claims.to_account(authority, client_info.as_ref()),
            (None, Some(account)) => account.clone(),
            (None, None) => {
                return Err(AuthError::InvalidIdToken(
                    "token response carried no ID token".to_string(),
                ))
            }
        };

        let granted = response
            .scope
            .as_deref()
            .map(|raw| ScopeSet::parse(raw).without_reserved())
            .filter(|scopes| !scopes.is_empty())
            .unwrap_or_else(|| requested.clone());

        let access_token = Credential::new(
            CredentialKind::Access,
            response.access_token,
            account.id.clone(),
            authority.as_str(),
        )
        .with_scopes(granted)
        .with_expiry(now + ChronoDuration::seconds(response.expires_in.max(0)));

        let refresh_token = response.refresh_token.map(|secret| {
            Credential::new(CredentialKind::Refresh, secret, account.id.clone(), authority.as_str())
        });

        let id_token = response.id_token.map(|raw| {
            let credential =
                Credential::new(CredentialKind::Id, raw, account.id.clone(), authority.as_str());
            match claims.as_ref().and_then(IdTokenClaims::expires_at) {
                Some(exp) => credential.with_expiry(exp),
                None => credential,
            }
        });

        self.cache
            .store_result(
                &account,
                authority,
                access_token.clone(),
                refresh_token,
                id_token.clone(),
            )
            .await?;

        Ok(AuthenticationResult {
            access_token,
            id_token,
            account,
            source,
            correlation_id: request.correlation_id,
        })
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.event_bus.emit(CoreEvent::Auth(event));
    }
}

/// Races `future` against cancellation and a timeout.
async fn guarded<T, F>(
    cancel: &CancellationToken,
    operation: &str,
    timeout: Duration,
    future: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AuthError::OperationCancelled),
        outcome = tokio::time::timeout(timeout, future) => match outcome {
            Ok(result) => result,
            Err(_) => Err(AuthError::OperationTimeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        },
    }
}

fn presenter_error(err: BridgeError) -> AuthError {
    match err {
        BridgeError::NotAvailable(message) => AuthError::CapabilityMissing {
            capability: "UiPresenter".to_string(),
            message,
        },
        other => AuthError::InvalidRedirect(format!("presenter failed: {}", other)),
    }
}
