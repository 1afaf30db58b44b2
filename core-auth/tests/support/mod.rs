//! Fake identity provider and host bridges for end-to-end broker tests.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use bridge_traits::presenter::{AuthorizationPrompt, PresenterOutcome, UiPresenter};
use bridge_traits::storage::SecureStore;
use bridge_traits::time::ManualClock;
use chrono::Utc;
use core_auth::RequestBroker;
use core_runtime::config::{ClientConfig, CoreConfig};
use core_runtime::events::EventBus;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const AUTHORITY: &str = "https://login.microsoftonline.com/contoso.onmicrosoft.com";
pub const REDIRECT_URI: &str = "http://localhost:8400/callback";
pub const APPROVED_CODE: &str = "approved-code";
pub const TENANT_ID: &str = "tenant-1";
pub const OBJECT_ID: &str = "object-1";
pub const USERNAME: &str = "alice@contoso.com";

#[derive(Default)]
struct ProviderState {
    valid_refresh_tokens: HashSet<String>,
    transient_failures: u32,
    granted_scopes: Option<String>,
    issued: usize,
}

/// In-memory stand-in for an OIDC provider's discovery and token endpoints.
#[derive(Default)]
pub struct FakeIdentityProvider {
    state: Mutex<ProviderState>,
    pub discovery_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub code_calls: AtomicUsize,
}

impl FakeIdentityProvider {
    /// Reply 503 to the next `count` refresh grants.
    pub fn fail_refreshes(&self, count: u32) {
        self.state.lock().unwrap().transient_failures = count;
    }

    /// Scopes reported as granted, instead of echoing the request.
    pub fn grant_scopes(&self, scopes: &str) {
        self.state.lock().unwrap().granted_scopes = Some(scopes.to_string());
    }

    pub fn revoke_all_refresh_tokens(&self) {
        self.state.lock().unwrap().valid_refresh_tokens.clear();
    }

    pub fn token_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst) + self.code_calls.load(Ordering::SeqCst)
    }

    pub fn network_calls(&self) -> usize {
        self.discovery_calls.load(Ordering::SeqCst) + self.token_calls()
    }

    fn issue(&self, requested_scope: &str) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        state.issued += 1;
        let refresh_token = format!("rt-{}", state.issued);
        state.valid_refresh_tokens.insert(refresh_token.clone());
        let scope = state
            .granted_scopes
            .clone()
            .unwrap_or_else(|| requested_scope.to_string());

        HttpResponse::json_body(
            200,
            &json!({
                "access_token": format!("at-{}", state.issued),
                "refresh_token": refresh_token,
                "id_token": id_token(),
                "token_type": "Bearer",
                "expires_in": 3600,
                "scope": scope,
            }),
        )
    }

    fn token_endpoint(&self, form: HashMap<String, String>) -> HttpResponse {
        let scope = form.get("scope").cloned().unwrap_or_default();
        match form.get("grant_type").map(String::as_str) {
            Some("refresh_token") => {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                {
                    let mut state = self.state.lock().unwrap();
                    if state.transient_failures > 0 {
                        state.transient_failures -= 1;
                        return HttpResponse::json_body(503, &json!({"error": "temporarily_unavailable"}));
                    }
                    let presented = form.get("refresh_token").cloned().unwrap_or_default();
                    if !state.valid_refresh_tokens.remove(&presented) {
                        return HttpResponse::json_body(
                            400,
                            &json!({
                                "error": "invalid_grant",
                                "error_description": "refresh token expired"
                            }),
                        );
                    }
                }
                self.issue(&scope)
            }
            Some("authorization_code") => {
                self.code_calls.fetch_add(1, Ordering::SeqCst);
                if form.get("code").map(String::as_str) != Some(APPROVED_CODE)
                    || form.get("code_verifier").map_or(true, |v| v.is_empty())
                {
                    return HttpResponse::json_body(400, &json!({"error": "invalid_grant"}));
                }
                self.issue(&scope)
            }
            _ => HttpResponse::json_body(400, &json!({"error": "unsupported_grant_type"})),
        }
    }
}

#[async_trait]
impl HttpClient for FakeIdentityProvider {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let path = Url::parse(&request.url)
            .map_err(|e| BridgeError::OperationFailed(e.to_string()))?
            .path()
            .to_string();

        if path.ends_with("/.well-known/openid-configuration") {
            self.discovery_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(HttpResponse::json_body(200, &discovery_document()));
        }
        if path.ends_with("/oauth2/v2.0/token") {
            return Ok(self.token_endpoint(request.form_params()));
        }
        Ok(HttpResponse::json_body(404, &json!({})))
    }
}

pub fn discovery_document() -> serde_json::Value {
    json!({
        "issuer": format!("https://login.microsoftonline.com/{}/v2.0", TENANT_ID),
        "authorization_endpoint": format!("{}/oauth2/v2.0/authorize", AUTHORITY),
        "token_endpoint": format!("{}/oauth2/v2.0/token", AUTHORITY),
        "end_session_endpoint": format!("{}/oauth2/v2.0/logout", AUTHORITY),
    })
}

pub fn id_token() -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = json!({
        "iss": format!("https://login.microsoftonline.com/{}/v2.0", TENANT_ID),
        "sub": "subject-1",
        "oid": OBJECT_ID,
        "tid": TENANT_ID,
        "preferred_username": USERNAME,
        "name": "Alice",
        "exp": Utc::now().timestamp() + 3600,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserBehaviour {
    Approve,
    Dismiss,
    /// Leave the window open until the flow is cancelled.
    Ignore,
}

/// A browser whose user behaves as scripted.
pub struct FakeBrowser {
    behaviour: Mutex<UserBehaviour>,
    delay: Duration,
    prompts: Mutex<Vec<AuthorizationPrompt>>,
}

impl FakeBrowser {
    pub fn new(behaviour: UserBehaviour) -> Self {
        Self {
            behaviour: Mutex::new(behaviour),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_behaviour(&self, behaviour: UserBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn prompts(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last_query(&self, name: &str) -> Option<String> {
        let prompts = self.prompts.lock().unwrap();
        let url = Url::parse(&prompts.last()?.authorization_url).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

#[async_trait]
impl UiPresenter for FakeBrowser {
    async fn present(
        &self,
        prompt: AuthorizationPrompt,
        cancel: CancellationToken,
    ) -> BridgeResult<PresenterOutcome> {
        self.prompts.lock().unwrap().push(prompt.clone());
        let behaviour = *self.behaviour.lock().unwrap();

        tokio::select! {
            _ = cancel.cancelled() => return Ok(PresenterOutcome::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }

        let state = Url::parse(&prompt.authorization_url)
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(k, _)| k == "state")
                    .map(|(_, v)| v.into_owned())
            })
            .unwrap_or_default();

        match behaviour {
            UserBehaviour::Approve => Ok(PresenterOutcome::Redirected(format!(
                "{}?code={}&state={}",
                prompt.redirect_uri, APPROVED_CODE, state
            ))),
            UserBehaviour::Dismiss => Ok(PresenterOutcome::Cancelled),
            UserBehaviour::Ignore => {
                cancel.cancelled().await;
                Ok(PresenterOutcome::Cancelled)
            }
        }
    }
}

#[derive(Default)]
pub struct KeychainStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl SecureStore for KeychainStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
        self.secrets
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
        Ok(self.secrets.lock().unwrap().get(key).cloned())
    }

    async fn delete_secret(&self, key: &str) -> BridgeResult<()> {
        self.secrets.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> BridgeResult<Vec<String>> {
        Ok(self.secrets.lock().unwrap().keys().cloned().collect())
    }
}

pub struct Host {
    pub provider: Arc<FakeIdentityProvider>,
    pub browser: Arc<FakeBrowser>,
    pub store: Arc<KeychainStore>,
    pub clock: Arc<ManualClock>,
    pub events: EventBus,
    pub broker: RequestBroker,
}

impl Host {
    pub fn new(browser: FakeBrowser) -> Self {
        let provider = Arc::new(FakeIdentityProvider::default());
        let browser = Arc::new(browser);
        let store = Arc::new(KeychainStore::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let events = EventBus::new(256);

        let config = CoreConfig::builder()
            .client(ClientConfig::new("integration-client", REDIRECT_URI))
            .default_authority(AUTHORITY)
            .http_client(provider.clone())
            .secure_store(store.clone())
            .presenter(browser.clone())
            .clock(clock.clone())
            .refresh_retry_backoff(Duration::from_millis(5))
            .build()
            .expect("valid config");
        let broker = RequestBroker::new(config, events.clone()).expect("broker");

        Self {
            provider,
            browser,
            store,
            clock,
            events,
            broker,
        }
    }

    pub fn approving() -> Self {
        Self::new(FakeBrowser::new(UserBehaviour::Approve))
    }
}
