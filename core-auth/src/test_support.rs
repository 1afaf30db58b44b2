//! Hand-written bridge doubles shared by the unit tests.

use crate::id_token::encode_unsigned;
use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bridge_traits::presenter::{AuthorizationPrompt, PresenterOutcome, UiPresenter};
use bridge_traits::storage::SecureStore;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const AUTHORITY: &str = "https://login.microsoftonline.com/common";
pub const DISCOVERY_URL: &str =
    "https://login.microsoftonline.com/common/.well-known/openid-configuration";
pub const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
pub const AUTHORIZE_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
pub const ISSUER: &str = "https://login.microsoftonline.com/{tenantid}/v2.0";
pub const REDIRECT_URI: &str = "http://localhost:8400/callback";

#[derive(Default)]
pub struct MemorySecureStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecureStore {
    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn insert_raw(&self, key: &str, value: &[u8]) {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
        self.insert_raw(key, value).await;
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
        Ok(self.raw(key).await)
    }

    async fn delete_secret(&self, key: &str) -> BridgeResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> BridgeResult<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

/// Replies from per-URL queues and records every request.
#[derive(Default)]
pub struct ScriptedHttpClient {
    routes: StdMutex<HashMap<String, VecDeque<BridgeResult<HttpResponse>>>>,
    requests: StdMutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl ScriptedHttpClient {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push(&self, url: &str, response: BridgeResult<HttpResponse>) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_json(&self, url: &str, status: u16, body: Value) {
        self.push(url, Ok(HttpResponse::json_body(status, &body)));
    }

    pub fn push_discovery(&self) {
        self.push_json(DISCOVERY_URL, 200, discovery_document());
    }

    pub fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    pub fn token_grant_types(&self) -> Vec<String> {
        self.requests_to(TOKEN_URL)
            .iter()
            .filter(|r| r.method == HttpMethod::Post)
            .filter_map(|r| r.form_params().get("grant_type").cloned())
            .collect()
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .routes
            .lock()
            .unwrap()
            .get_mut(&url)
            .and_then(|queue| queue.pop_front());

        next.unwrap_or_else(|| {
            Err(BridgeError::OperationFailed(format!(
                "no scripted response for {}",
                url
            )))
        })
    }
}

pub enum PresenterScript {
    /// Redirect back with `code` and the prompt's state.
    Approve { code: String },
    /// Redirect back with an `error=` query.
    Error { error: String, subcode: Option<String> },
    /// User closed the window.
    Dismiss,
    /// Never finish on its own.
    Hang,
}

pub struct ScriptedPresenter {
    script: PresenterScript,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: StdMutex<Vec<AuthorizationPrompt>>,
}

impl ScriptedPresenter {
    pub fn new(script: PresenterScript) -> Self {
        Self {
            script,
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: StdMutex::new(Vec::new()),
        }
    }

    pub fn approving(code: &str) -> Self {
        Self::new(PresenterScript::Approve {
            code: code.to_string(),
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<AuthorizationPrompt> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

fn state_of(authorization_url: &str) -> String {
    Url::parse(authorization_url)
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or_default()
}

#[async_trait]
impl UiPresenter for ScriptedPresenter {
    async fn present(
        &self,
        prompt: AuthorizationPrompt,
        cancel: CancellationToken,
    ) -> BridgeResult<PresenterOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let state = state_of(&prompt.authorization_url);
        match &self.script {
            PresenterScript::Approve { code } => Ok(PresenterOutcome::Redirected(format!(
                "{}?code={}&state={}",
                prompt.redirect_uri, code, state
            ))),
            PresenterScript::Error { error, subcode } => {
                let mut redirect = format!("{}?error={}&state={}", prompt.redirect_uri, error, state);
                if let Some(subcode) = subcode {
                    redirect.push_str(&format!("&error_subcode={}", subcode));
                }
                Ok(PresenterOutcome::Redirected(redirect))
            }
            PresenterScript::Dismiss => Ok(PresenterOutcome::Cancelled),
            PresenterScript::Hang => {
                cancel.cancelled().await;
                Ok(PresenterOutcome::Cancelled)
            }
        }
    }
}

pub fn discovery_document() -> Value {
    json!({
        "issuer": ISSUER,
        "authorization_endpoint": AUTHORIZE_URL,
        "token_endpoint": TOKEN_URL,
        "end_session_endpoint": "https://login.microsoftonline.com/common/oauth2/v2.0/logout",
        "jwks_uri": "https://login.microsoftonline.com/common/discovery/v2.0/keys"
    })
}

pub fn id_token(oid: &str, tid: &str, username: &str) -> String {
    encode_unsigned(&json!({
        "iss": format!("https://login.microsoftonline.com/{}/v2.0", tid),
        "sub": format!("sub-{}", oid),
        "oid": oid,
        "tid": tid,
        "preferred_username": username,
        "name": "Test User",
        "exp": 4_000_000_000i64
    }))
}

pub fn token_response(access: &str, refresh: Option<&str>, scope: &str) -> Value {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 3600,
        "scope": scope,
        "id_token": id_token("uid", "utid", "alice@contoso.com")
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    body
}
