//! # Request Broker
//!
//! Public entry point for token acquisition.
//!
//! ## Overview
//!
//! The `RequestBroker` owns the token cache, the authority resolver and the
//! acquisition state machine built from a [`CoreConfig`]. Every call to
//! [`RequestBroker::acquire_token`] is keyed by (account, authority, scopes,
//! policy, force_refresh): at most one flow per key runs at a time and
//! duplicate requests await the in-flight result instead of starting a
//! second flow. Two identical requests therefore never show two sign-in
//! prompts. Requests that differ only in how far they may go run their own
//! flows, so a silent request never hands its `InteractionRequired` to an
//! interactive one.
//!
//! ## Cancellation
//!
//! The leader runs the flow under its own cancellation token. Followers
//! race the shared result against their own token. When a leader is
//! cancelled, or its future is dropped, the slot is released by a drop guard
//! and followers that are still live start a fresh flow.
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::{AcquisitionRequest, RequestBroker};
//! use core_runtime::config::{ClientConfig, CoreConfig};
//! use core_runtime::events::EventBus;
//! # use std::sync::Arc;
//! # use bridge_traits::{http::HttpClient, SecureStore};
//! # async fn run(http: Arc<dyn HttpClient>, store: Arc<dyn SecureStore>) -> core_auth::Result<()> {
//! let config = CoreConfig::builder()
//!     .client(ClientConfig::new("client-id", "http://localhost:8400/callback"))
//!     .http_client(http)
//!     .secure_store(store)
//!     .build()?;
//!
//! let broker = RequestBroker::new(config, EventBus::new(100))?;
//! let result = broker
//!     .acquire_token_silent(AcquisitionRequest::for_scopes(["mail.read"]))
//!     .await?;
//! println!("token from {}", result.source);
//! # Ok(())
//! # }
//! ```

use crate::acquisition::AcquisitionStateMachine;
use crate::authority::AuthorityResolver;
use crate::error::{AuthError, Result};
use crate::oauth::TokenClient;
use crate::token_cache::TokenCache;
use crate::types::{
    AcquisitionRequest, Account, AccountId, AuthenticationResult, Authority, InteractionPolicy,
};
use core_runtime::config::CoreConfig;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;
use tracing::{debug, info, instrument};

type SharedResult = Option<Result<AuthenticationResult>>;

/// Identity of an acquisition for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    subject: String,
    authority: String,
    scopes: String,
    policy: InteractionPolicy,
    force_refresh: bool,
}

impl FlightKey {
    fn for_request(request: &AcquisitionRequest, authority: &Authority) -> Self {
        let subject = match (&request.account, &request.login_hint) {
            (Some(account), _) => format!("account:{}", account),
            (None, Some(hint)) => format!("hint:{}", hint.to_lowercase()),
            (None, None) => String::new(),
        };
        Self {
            subject,
            authority: authority.as_str().to_string(),
            scopes: request.scopes.without_reserved().canonical_key(),
            policy: request.policy,
            force_refresh: request.force_refresh,
        }
    }
}

type FlightMap = Arc<StdMutex<HashMap<FlightKey, watch::Receiver<SharedResult>>>>;

/// Removes the in-flight slot when the leading flow ends, however it ends.
struct SlotGuard {
    in_flight: FlightMap,
    key: FlightKey,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.key);
        }
    }
}

enum Role {
    Leader(watch::Sender<SharedResult>, SlotGuard),
    Follower(watch::Receiver<SharedResult>),
}

/// Token acquisition entry point.
pub struct RequestBroker {
    machine: AcquisitionStateMachine,
    cache: TokenCache,
    resolver: Arc<AuthorityResolver>,
    event_bus: EventBus,
    in_flight: FlightMap,
}

impl RequestBroker {
    /// Builds the cache, resolver and state machine from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidRequest`] when the configuration does not
    /// validate.
    pub fn new(config: CoreConfig, event_bus: EventBus) -> Result<Self> {
        config.validate()?;

        let cache = TokenCache::new(
            Arc::clone(&config.secure_store),
            Arc::clone(&config.clock),
            config.acquisition.refresh_buffer,
        );
        let resolver = Arc::new(
            AuthorityResolver::from_config(&config).with_event_bus(event_bus.clone()),
        );
        let token_client = Arc::new(TokenClient::new(
            config.client.clone(),
            Arc::clone(&config.http_client),
        ));
        let machine = AcquisitionStateMachine::new(
            cache.clone(),
            Arc::clone(&resolver),
            token_client,
            config.presenter.clone(),
            Arc::clone(&config.clock),
            config.acquisition,
            config.default_authority.clone(),
            event_bus.clone(),
        );

        info!(
            client_id = %config.client.client_id,
            authority = %config.default_authority,
            interactive = config.supports_interaction(),
            "Request broker initialized"
        );

        Ok(Self {
            machine,
            cache,
            resolver,
            event_bus,
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    /// Acquires a token for `request`, joining an identical in-flight
    /// acquisition when there is one.
    ///
    /// # Errors
    ///
    /// Any [`AuthError`] produced by the flow. A caller whose own token is
    /// cancelled gets [`AuthError::OperationCancelled`].
    #[instrument(skip(self, request), fields(correlation_id = %request.correlation_id, scopes = %request.scopes))]
    pub async fn acquire_token(&self, request: AcquisitionRequest) -> Result<AuthenticationResult> {
        request.validate()?;
        let authority = self.machine.authority_for(&request)?;
        let key = FlightKey::for_request(&request, &authority);

        loop {
            match self.claim(&key) {
                Role::Leader(sender, _slot) => {
                    self.emit(AuthEvent::AcquisitionStarted {
                        correlation_id: request.correlation_id.to_string(),
                        scopes: request.scopes.to_oauth_string(),
                    });
                    let outcome = self.machine.run(&request).await;
                    debug!(states = ?outcome.trace.states(), "Acquisition finished");
                    let _ = sender.send(Some(outcome.result.clone()));
                    return outcome.result;
                }
                Role::Follower(receiver) => {
                    debug!("Joining in-flight acquisition");
                    match self.await_in_flight(receiver, &request).await {
                        Some(result) => return result,
                        None => {
                            debug!("In-flight acquisition was abandoned, starting a new one");
                            tokio::task::yield_now().await;
                        }
                    }
                }
            }
        }
    }

    /// Acquires a token without ever prompting the user.
    pub async fn acquire_token_silent(
        &self,
        request: AcquisitionRequest,
    ) -> Result<AuthenticationResult> {
        self.acquire_token(request.with_policy(InteractionPolicy::Silent))
            .await
    }

    /// Acquires a token by prompting the user, skipping the cache.
    pub async fn acquire_token_interactive(
        &self,
        request: AcquisitionRequest,
    ) -> Result<AuthenticationResult> {
        self.acquire_token(request.with_policy(InteractionPolicy::Interactive))
            .await
    }

    /// Accounts with cached tokens.
    pub async fn accounts(&self) -> Result<Vec<Account>> {
        self.cache.accounts().await
    }

    /// Signs `account` out by removing all of its cached tokens.
    #[instrument(skip(self), fields(account_id = %account))]
    pub async fn remove_account(&self, account: &AccountId) -> Result<()> {
        let removed = self.cache.invalidate(account).await?;
        self.emit(AuthEvent::SignedOut {
            account_id: account.to_string(),
        });
        info!(partitions = removed, "Account signed out");
        Ok(())
    }

    pub fn authority_resolver(&self) -> &AuthorityResolver {
        &self.resolver
    }

    pub fn token_cache(&self) -> &TokenCache {
        &self.cache
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Number of acquisitions currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or_default()
    }

    fn claim(&self, key: &FlightKey) -> Role {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(receiver) = in_flight.get(key) {
            return Role::Follower(receiver.clone());
        }

        let (sender, receiver) = watch::channel(None);
        in_flight.insert(key.clone(), receiver);
        Role::Leader(
            sender,
            SlotGuard {
                in_flight: Arc::clone(&self.in_flight),
                key: key.clone(),
            },
        )
    }

    /// Waits for the leader's result. `None` means the leader went away
    /// without one and the caller should try again.
    async fn await_in_flight(
        &self,
        mut receiver: watch::Receiver<SharedResult>,
        request: &AcquisitionRequest,
    ) -> Option<Result<AuthenticationResult>> {
        let shared = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Some(Err(AuthError::OperationCancelled)),
            shared = receiver.wait_for(|value| value.is_some()) => {
                shared.ok().and_then(|value| value.clone())
            }
        };

        match shared {
            Some(Err(AuthError::OperationCancelled)) | None => {
                if request.cancel.is_cancelled() {
                    Some(Err(AuthError::OperationCancelled))
                } else {
                    None
                }
            }
            Some(result) => Some(result.map(|mut auth| {
                auth.correlation_id = request.correlation_id;
                auth
            })),
        }
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.event_bus.emit(CoreEvent::Auth(event));
    }
}
