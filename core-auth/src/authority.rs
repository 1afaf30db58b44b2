//! Authority Resolver
//!
//! Validates authority URLs and resolves their OpenID discovery metadata
//! (`<authority>/.well-known/openid-configuration`).
//!
//! The metadata cache is owned by the resolver instance; there is no process
//! global. Each authority is fetched once per resolver lifetime unless it is
//! invalidated, force-refreshed, or its optional freshness window lapses.
//! Concurrent resolutions that miss the cache share one fetch. No lock is
//! held while discovery runs, so a forced refetch never delays callers that
//! can be served from the cache.

use crate::error::{AuthError, Result};
use crate::types::{Authority, AuthorityMetadata};
use bridge_traits::http::{HttpClient, HttpRequest};
use bridge_traits::time::{Clock, SystemClock};
use chrono::Duration as ChronoDuration;
use core_runtime::config::{AuthorityValidation, CoreConfig};
use core_runtime::events::{AuthorityEvent, CoreEvent, EventBus};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use url::Url;

const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    end_session_endpoint: Option<String>,
}

type SharedFetch = Option<Result<AuthorityMetadata>>;

#[derive(Default)]
struct Entry {
    metadata: Option<AuthorityMetadata>,
    pending: Option<PendingFetch>,
}

struct PendingFetch {
    id: u64,
    receiver: watch::Receiver<SharedFetch>,
}

/// Clears the pending marker when the fetching caller finishes or is dropped.
struct FetchGuard<'a> {
    resolver: &'a AuthorityResolver,
    key: String,
    id: u64,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.resolver.entries();
        if let Some(entry) = entries.get_mut(&self.key) {
            if entry.pending.as_ref().is_some_and(|p| p.id == self.id) {
                entry.pending = None;
            }
        }
    }
}

enum Claim<'a> {
    Cached(AuthorityMetadata),
    Fetch(watch::Sender<SharedFetch>, FetchGuard<'a>),
    Wait(watch::Receiver<SharedFetch>),
}

/// Resolves and caches authority metadata.
pub struct AuthorityResolver {
    http_client: Arc<dyn HttpClient>,
    validation: AuthorityValidation,
    clock: Arc<dyn Clock>,
    metadata_ttl: Option<Duration>,
    timeout: Duration,
    event_bus: Option<EventBus>,
    entries: StdMutex<HashMap<String, Entry>>,
    fetch_ids: AtomicU64,
}

impl AuthorityResolver {
    pub fn new(http_client: Arc<dyn HttpClient>, validation: AuthorityValidation) -> Self {
        Self {
            http_client,
            validation,
            clock: Arc::new(SystemClock),
            metadata_ttl: None,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            event_bus: None,
            entries: StdMutex::new(HashMap::new()),
            fetch_ids: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        let mut resolver = Self::new(
            Arc::clone(&config.http_client),
            config.authority_validation.clone(),
        )
        .with_clock(Arc::clone(&config.clock))
        .with_timeout(config.acquisition.default_timeout);
        resolver.metadata_ttl = config.acquisition.metadata_ttl;
        resolver
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Re-resolve metadata older than `ttl`.
    pub fn with_metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = Some(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Normalizes `authority_url` and checks it against the allow-list.
    pub fn validate(&self, authority_url: &str) -> Result<Authority> {
        let authority = Authority::parse(authority_url)?;
        if !self.validation.is_trusted_host(authority.host()) {
            warn!(host = %authority.host(), "Authority host is not in the known hosts list");
            return Err(AuthError::UntrustedAuthority(format!(
                "{} is not a known authority host",
                authority.host()
            )));
        }
        Ok(authority)
    }

    pub async fn resolve(&self, authority_url: &str) -> Result<AuthorityMetadata> {
        self.resolve_with(authority_url, false).await
    }

    /// Resolves metadata, bypassing the cache when `force_refresh` is set.
    ///
    /// A caller that misses the cache joins a fetch already running for the
    /// same authority instead of starting another one.
    #[instrument(skip(self))]
    pub async fn resolve_with(
        &self,
        authority_url: &str,
        force_refresh: bool,
    ) -> Result<AuthorityMetadata> {
        let authority = self.validate(authority_url)?;

        loop {
            match self.claim(&authority, force_refresh) {
                Claim::Cached(metadata) => {
                    debug!(authority = %authority, "Authority metadata served from cache");
                    return Ok(metadata);
                }
                Claim::Fetch(sender, _guard) => {
                    let fetched = self.fetch(&authority).await;
                    if let Ok(ref metadata) = fetched {
                        self.store(&authority, metadata.clone());
                        info!(authority = %authority, issuer = %metadata.issuer, "Authority resolved");
                        self.emit(AuthorityEvent::Resolved {
                            authority: authority.as_str().to_string(),
                            issuer: metadata.issuer.clone(),
                        });
                    }
                    let _ = sender.send(Some(fetched.clone()));
                    return fetched;
                }
                Claim::Wait(mut receiver) => {
                    debug!(authority = %authority, "Joining in-flight discovery");
                    let shared = match receiver.wait_for(|value| value.is_some()).await {
                        Ok(value) => value.clone(),
                        Err(_) => None,
                    };
                    match shared {
                        Some(result) => return result,
                        None => debug!(authority = %authority, "In-flight discovery was abandoned"),
                    }
                }
            }
        }
    }

    /// Drops cached metadata for `authority_url`. Returns whether anything
    /// was cached.
    pub fn invalidate(&self, authority_url: &str) -> bool {
        let Ok(authority) = Authority::parse(authority_url) else {
            return false;
        };

        let removed = self
            .entries()
            .get_mut(authority.as_str())
            .and_then(|entry| entry.metadata.take())
            .is_some();

        if removed {
            info!(authority = %authority, "Authority metadata invalidated");
            self.emit(AuthorityEvent::Invalidated {
                authority: authority.as_str().to_string(),
            });
        }
        removed
    }

    /// Whether fresh metadata is cached for `authority_url`.
    pub fn is_cached(&self, authority_url: &str) -> bool {
        let Ok(authority) = Authority::parse(authority_url) else {
            return false;
        };
        let entries = self.entries();
        entries
            .get(authority.as_str())
            .and_then(|entry| entry.metadata.as_ref())
            .is_some_and(|metadata| self.is_fresh(metadata))
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn claim(&self, authority: &Authority, force_refresh: bool) -> Claim<'_> {
        let mut entries = self.entries();
        let entry = entries.entry(authority.as_str().to_string()).or_default();

        if !force_refresh {
            if let Some(metadata) = entry.metadata.as_ref().filter(|m| self.is_fresh(m)) {
                return Claim::Cached(metadata.clone());
            }
        }
        if let Some(ref pending) = entry.pending {
            return Claim::Wait(pending.receiver.clone());
        }

        let id = self.fetch_ids.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        entry.pending = Some(PendingFetch { id, receiver });
        Claim::Fetch(
            sender,
            FetchGuard {
                resolver: self,
                key: authority.as_str().to_string(),
                id,
            },
        )
    }

    fn store(&self, authority: &Authority, metadata: AuthorityMetadata) {
        self.entries()
            .entry(authority.as_str().to_string())
            .or_default()
            .metadata = Some(metadata);
    }

    fn is_fresh(&self, metadata: &AuthorityMetadata) -> bool {
        match self.metadata_ttl.and_then(|ttl| ChronoDuration::from_std(ttl).ok()) {
            Some(ttl) => self.clock.now() < metadata.resolved_at + ttl,
            None => true,
        }
    }

    async fn fetch(&self, authority: &Authority) -> Result<AuthorityMetadata> {
        let discovery_url = authority.discovery_url();
        let discovery_error = |reason: String| AuthError::DiscoveryError {
            authority: authority.as_str().to_string(),
            reason,
        };

        debug!(url = %discovery_url, "Fetching discovery document");
        let request = HttpRequest::get_json(discovery_url).timeout(self.timeout);

        let response = self.http_client.execute(request).await.map_err(|e| {
            warn!(authority = %authority, error = %e, "Discovery request failed");
            discovery_error(e.to_string())
        })?;

        if !response.is_success() {
            warn!(authority = %authority, status = response.status, "Discovery endpoint returned an error");
            return Err(discovery_error(format!(
                "discovery endpoint returned {}",
                response.status
            )));
        }

        let document: DiscoveryDocument = response
            .json()
            .map_err(|e| discovery_error(format!("malformed discovery document: {}", e)))?;

        require_https(&document.authorization_endpoint).map_err(&discovery_error)?;
        require_https(&document.token_endpoint).map_err(&discovery_error)?;
        if let Some(ref end_session) = document.end_session_endpoint {
            require_https(end_session).map_err(&discovery_error)?;
        }

        Ok(AuthorityMetadata {
            issuer: document.issuer,
            authorization_endpoint: document.authorization_endpoint,
            token_endpoint: document.token_endpoint,
            end_session_endpoint: document.end_session_endpoint,
            resolved_at: self.clock.now(),
        })
    }

    fn emit(&self, event: AuthorityEvent) {
        if let Some(ref bus) = self.event_bus {
            let _ = bus.emit(CoreEvent::Authority(event));
        }
    }
}

fn require_https(endpoint: &str) -> std::result::Result<(), String> {
    match Url::parse(endpoint) {
        Ok(url) if url.scheme() == "https" => Ok(()),
        Ok(_) => Err(format!("endpoint {} is not https", endpoint)),
        Err(e) => Err(format!("endpoint {} is not a valid URL: {}", endpoint, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        discovery_document, ScriptedHttpClient, AUTHORITY, DISCOVERY_URL, TOKEN_URL,
    };
    use bridge_traits::error::BridgeError;
    use bridge_traits::time::ManualClock;
    use chrono::Utc;
    use serde_json::json;

    fn resolver(http: Arc<ScriptedHttpClient>) -> AuthorityResolver {
        AuthorityResolver::new(http, AuthorityValidation::default())
    }

    #[tokio::test]
    async fn test_resolves_once_and_caches() {
        let http = Arc::new(ScriptedHttpClient::default());
        http.push_discovery();
        let resolver = resolver(http.clone());

        let first = resolver.resolve(AUTHORITY).await.unwrap();
        let second = resolver.resolve("https://LOGIN.microsoftonline.com/common/").await.unwrap();

        assert_eq!(first.token_endpoint, TOKEN_URL);
        assert_eq!(first, second);
        assert_eq!(http.requests_to(DISCOVERY_URL).len(), 1);
        assert!(resolver.is_cached(AUTHORITY));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_resolutions_share_one_fetch() {
        let http = Arc::new(ScriptedHttpClient::with_delay(Duration::from_millis(50)));
        http.push_discovery();
        let resolver = Arc::new(resolver(http.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move { resolver.resolve(AUTHORITY).await })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(http.requests_to(DISCOVERY_URL).len(), 1);
    }

    #[tokio::test]
    async fn test_cached_resolution_is_not_blocked_by_forced_refetch() {
        let http = Arc::new(ScriptedHttpClient::with_delay(Duration::from_millis(300)));
        http.push_discovery();
        http.push_discovery();
        let resolver = resolver(http.clone());
        resolver.resolve(AUTHORITY).await.unwrap();

        let cached_read = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(resolver.is_cached(AUTHORITY));
            let started = tokio::time::Instant::now();
            let metadata = resolver.resolve(AUTHORITY).await;
            (metadata, started.elapsed())
        };

        let (refetched, (cached, elapsed)) =
            tokio::join!(resolver.resolve_with(AUTHORITY, true), cached_read);

        assert!(refetched.is_ok());
        assert!(cached.is_ok());
        assert!(elapsed < Duration::from_millis(100), "cache hit waited {:?}", elapsed);
        assert_eq!(http.requests_to(DISCOVERY_URL).len(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_fetch_does_not_block_later_resolution() {
        let http = Arc::new(ScriptedHttpClient::with_delay(Duration::from_millis(50)));
        http.push_discovery();
        http.push_discovery();
        let resolver = resolver(http.clone());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), resolver.resolve(AUTHORITY)).await;
        assert!(abandoned.is_err());
        assert!(!resolver.is_cached(AUTHORITY));

        let metadata = tokio::time::timeout(Duration::from_secs(2), resolver.resolve(AUTHORITY))
            .await
            .expect("a dropped fetch must not wedge the authority");
        assert_eq!(metadata.unwrap().token_endpoint, TOKEN_URL);
        assert_eq!(http.requests_to(DISCOVERY_URL).len(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_and_invalidate_refetch() {
        let http = Arc::new(ScriptedHttpClient::default());
        for _ in 0..3 {
            http.push_discovery();
        }
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let resolver = resolver(http.clone()).with_event_bus(bus);

        resolver.resolve(AUTHORITY).await.unwrap();
        resolver.resolve_with(AUTHORITY, true).await.unwrap();
        assert_eq!(http.requests_to(DISCOVERY_URL).len(), 2);

        assert!(resolver.invalidate(AUTHORITY));
        assert!(!resolver.is_cached(AUTHORITY));
        assert!(!resolver.invalidate(AUTHORITY));

        resolver.resolve(AUTHORITY).await.unwrap();
        assert_eq!(http.requests_to(DISCOVERY_URL).len(), 3);

        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Authority(AuthorityEvent::Resolved { .. })
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Authority(AuthorityEvent::Resolved { .. })
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Authority(AuthorityEvent::Invalidated { .. })
        ));
    }

    #[tokio::test]
    async fn test_metadata_ttl_expires() {
        let http = Arc::new(ScriptedHttpClient::default());
        http.push_discovery();
        http.push_discovery();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let resolver = resolver(http.clone())
            .with_clock(clock.clone())
            .with_metadata_ttl(Duration::from_secs(60));

        resolver.resolve(AUTHORITY).await.unwrap();
        clock.advance(ChronoDuration::seconds(30));
        resolver.resolve(AUTHORITY).await.unwrap();
        assert_eq!(http.requests_to(DISCOVERY_URL).len(), 1);

        clock.advance(ChronoDuration::seconds(31));
        assert!(!resolver.is_cached(AUTHORITY));
        resolver.resolve(AUTHORITY).await.unwrap();
        assert_eq!(http.requests_to(DISCOVERY_URL).len(), 2);
    }

    #[tokio::test]
    async fn test_untrusted_authorities_never_hit_the_network() {
        let http = Arc::new(ScriptedHttpClient::default());
        let resolver = resolver(http.clone());

        for raw in [
            "http://login.microsoftonline.com/common",
            "https://evil.example.com/common",
            "https://login.microsoftonline.com/common?x=y",
        ] {
            assert!(matches!(
                resolver.resolve(raw).await,
                Err(AuthError::UntrustedAuthority(_))
            ));
        }
        assert_eq!(http.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_disabled_validation_allows_custom_hosts() {
        let http = Arc::new(ScriptedHttpClient::default());
        http.push_json(
            "https://idp.example.com/realm/.well-known/openid-configuration",
            200,
            json!({
                "issuer": "https://idp.example.com/realm",
                "authorization_endpoint": "https://idp.example.com/realm/auth",
                "token_endpoint": "https://idp.example.com/realm/token"
            }),
        );
        let resolver = AuthorityResolver::new(http, AuthorityValidation::disabled());

        let metadata = resolver.resolve("https://idp.example.com/realm").await.unwrap();
        assert_eq!(metadata.issuer, "https://idp.example.com/realm");
        assert!(metadata.end_session_endpoint.is_none());
    }

    #[tokio::test]
    async fn test_discovery_failures() {
        let http = Arc::new(ScriptedHttpClient::default());
        http.push_json(DISCOVERY_URL, 404, json!({"error": "not_found"}));
        http.push(DISCOVERY_URL, Err(BridgeError::Timeout("connect".into())));
        http.push_json(DISCOVERY_URL, 200, json!({"issuer": "x"}));
        let mut insecure = discovery_document();
        insecure["token_endpoint"] = json!("http://login.microsoftonline.com/common/token");
        http.push_json(DISCOVERY_URL, 200, insecure);

        let resolver = resolver(http);
        for _ in 0..4 {
            assert!(matches!(
                resolver.resolve(AUTHORITY).await,
                Err(AuthError::DiscoveryError { .. })
            ));
        }
        assert!(!resolver.is_cached(AUTHORITY));
    }
}
