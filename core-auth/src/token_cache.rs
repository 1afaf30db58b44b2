//! Token Cache
//!
//! Persists access, refresh and ID tokens through the host `SecureStore`
//! (Keychain, Keystore, DPAPI...).
//!
//! ## Layout
//!
//! One JSON blob per (account, authority host) partition, stored under
//! `token_cache:<account_id>|<host>`. A partition holds the account record,
//! any number of access tokens (one per authority and scope set), one ID
//! token per authority and at most one refresh token.
//!
//! The refresh token is shared by every tenant authority on the host: the
//! identity provider issues multi-tenant refresh tokens, so signing in to
//! `https://host/tenant-a` lets a silent request for `https://host/tenant-b`
//! redeem the same refresh token. Access and ID tokens are never shared
//! across authorities, since their audience and issuer are tenant specific.
//!
//! ## Semantics
//!
//! - Lookups match the exact normalized authority and use scope-superset
//!   semantics: a token granted for `{mail.read, mail.send}` satisfies a
//!   request for `{mail.read}`.
//! - Expired access tokens are evicted during lookup; nothing scans eagerly.
//! - A partition that fails to deserialize is deleted and reported as a miss.
//! - Every read-modify-write runs under one short-held async mutex. No network
//!   I/O ever happens while it is held.
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::token_cache::{CacheLookup, TokenCache};
//! use core_auth::{AccountId, Authority, ScopeSet};
//! # use bridge_traits::{SecureStore, SystemClock};
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # async fn example(secure_store: Arc<dyn SecureStore>) -> core_auth::Result<()> {
//! let cache = TokenCache::new(secure_store, Arc::new(SystemClock), Duration::from_secs(300));
//! let authority = Authority::parse("https://login.microsoftonline.com/common")?;
//!
//! match cache
//!     .lookup(&AccountId::new("uid.utid"), &authority, &ScopeSet::parse("mail.read"))
//!     .await?
//! {
//!     CacheLookup::Hit(token) => println!("cached until {:?}", token.expires_at),
//!     CacheLookup::Miss => println!("need to refresh"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::{Account, AccountId, Authority, Credential, CredentialKind, ScopeSet};
use bridge_traits::storage::SecureStore;
use bridge_traits::time::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const KEY_PREFIX: &str = "token_cache:";
const PARTITION_VERSION: u32 = 2;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(Credential),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachePartition {
    version: u32,
    #[serde(default)]
    account: Option<Account>,
    #[serde(default)]
    access_tokens: Vec<Credential>,
    #[serde(default)]
    refresh_token: Option<Credential>,
    #[serde(default)]
    id_tokens: Vec<Credential>,
}

impl CachePartition {
    fn empty() -> Self {
        Self {
            version: PARTITION_VERSION,
            account: None,
            access_tokens: Vec::new(),
            refresh_token: None,
            id_tokens: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.access_tokens.is_empty()
            && self.refresh_token.is_none()
            && self.id_tokens.is_empty()
    }
}

/// Secure, partitioned token cache.
#[derive(Clone)]
pub struct TokenCache {
    secure_store: Arc<dyn SecureStore>,
    clock: Arc<dyn Clock>,
    refresh_buffer: Duration,
    lock: Arc<Mutex<()>>,
}

impl TokenCache {
    /// `refresh_buffer`: access tokens expiring within this window are not
    /// returned.
    pub fn new(
        secure_store: Arc<dyn SecureStore>,
        clock: Arc<dyn Clock>,
        refresh_buffer: Duration,
    ) -> Self {
        debug!("Initializing TokenCache");
        Self {
            secure_store,
            clock,
            refresh_buffer,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn storage_key(account: &AccountId, host: &str) -> String {
        format!("{}{}|{}", KEY_PREFIX, account, host)
    }

    fn key_for_credential(credential: &Credential) -> Result<String> {
        let authority = Authority::parse(&credential.authority)?;
        Ok(Self::storage_key(&credential.account_id, authority.host()))
    }

    /// Finds an unexpired access token for `account` at `authority` covering
    /// `scopes` (reserved OIDC scopes ignored).
    pub async fn lookup(
        &self,
        account: &AccountId,
        authority: &Authority,
        scopes: &ScopeSet,
    ) -> Result<CacheLookup> {
        let _guard = self.lock.lock().await;
        let key = Self::storage_key(account, authority.host());

        let Some(mut partition) = self.load(&key).await? else {
            debug!(account_id = %account, "Cache miss: no partition");
            return Ok(CacheLookup::Miss);
        };

        let now = self.clock.now();
        let before = partition.access_tokens.len();
        partition
            .access_tokens
            .retain(|token| !token.is_expired_at(now, self.refresh_buffer));
        let evicted = before - partition.access_tokens.len();

        if evicted > 0 {
            debug!(account_id = %account, evicted, "Evicted expired access tokens");
            self.save(&key, &partition).await?;
        }

        let wanted = scopes.without_reserved();
        let hit = partition
            .access_tokens
            .iter()
            .find(|token| token.authority == authority.as_str() && token.scopes.is_superset_of(&wanted))
            .cloned();

        match hit {
            Some(token) => {
                debug!(account_id = %account, scopes = %token.scopes, "Cache hit");
                Ok(CacheLookup::Hit(token))
            }
            None => {
                debug!(account_id = %account, scopes = %wanted, "Cache miss");
                Ok(CacheLookup::Miss)
            }
        }
    }

    /// Stores a single credential.
    ///
    /// Access tokens replace tokens for the same authority whose scopes
    /// intersect; already-expired access tokens are dropped.
    pub async fn store(&self, credential: Credential) -> Result<()> {
        let _guard = self.lock.lock().await;
        let key = Self::key_for_credential(&credential)?;
        let mut partition = self.load(&key).await?.unwrap_or_else(CachePartition::empty);
        self.merge(&mut partition, credential);
        self.save(&key, &partition).await
    }

    /// Atomically stores the outcome of a token response.
    pub async fn store_result(
        &self,
        account: &Account,
        authority: &Authority,
        access_token: Credential,
        refresh_token: Option<Credential>,
        id_token: Option<Credential>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let key = Self::storage_key(&account.id, authority.host());
        let mut partition = self.load(&key).await?.unwrap_or_else(CachePartition::empty);

        partition.account = Some(account.clone());
        self.merge(&mut partition, access_token);
        if let Some(refresh) = refresh_token {
            self.merge(&mut partition, refresh);
        }
        if let Some(id) = id_token {
            self.merge(&mut partition, id);
        }

        self.save(&key, &partition).await?;
        info!(
            account_id = %account.id,
            authority = %authority,
            has_refresh_token = partition.refresh_token.is_some(),
            "Tokens cached"
        );
        Ok(())
    }

    fn merge(&self, partition: &mut CachePartition, credential: Credential) {
        match credential.kind {
            CredentialKind::Access => {
                if credential.is_expired_at(self.clock.now(), Duration::ZERO) {
                    debug!(account_id = %credential.account_id, "Skipping already-expired access token");
                    return;
                }
                partition.access_tokens.retain(|existing| {
                    existing.authority != credential.authority
                        || !existing.scopes.intersects(&credential.scopes)
                });
                partition.access_tokens.push(credential);
            }
            CredentialKind::Refresh => partition.refresh_token = Some(credential),
            CredentialKind::Id => {
                partition
                    .id_tokens
                    .retain(|existing| existing.authority != credential.authority);
                partition.id_tokens.push(credential);
            }
        }
    }

    pub async fn refresh_token(
        &self,
        account: &AccountId,
        authority: &Authority,
    ) -> Result<Option<Credential>> {
        let _guard = self.lock.lock().await;
        let key = Self::storage_key(account, authority.host());
        Ok(self.load(&key).await?.and_then(|p| p.refresh_token))
    }

    pub async fn id_token(
        &self,
        account: &AccountId,
        authority: &Authority,
    ) -> Result<Option<Credential>> {
        let _guard = self.lock.lock().await;
        let key = Self::storage_key(account, authority.host());
        Ok(self.load(&key).await?.and_then(|p| {
            p.id_tokens
                .into_iter()
                .find(|id| id.authority == authority.as_str())
        }))
    }

    /// Drops a refresh token the server reported as expired or revoked.
    pub async fn remove_refresh_token(&self, account: &AccountId, authority: &Authority) -> Result<()> {
        let _guard = self.lock.lock().await;
        let key = Self::storage_key(account, authority.host());

        if let Some(mut partition) = self.load(&key).await? {
            if partition.refresh_token.take().is_some() {
                self.save(&key, &partition).await?;
                info!(account_id = %account, "Removed rejected refresh token");
            }
        }
        Ok(())
    }

    /// All accounts with a cached partition, de-duplicated by id.
    pub async fn accounts(&self) -> Result<Vec<Account>> {
        let _guard = self.lock.lock().await;
        let mut accounts: Vec<Account> = Vec::new();

        for key in self.partition_keys().await? {
            let Some(partition) = self.load(&key).await? else {
                continue;
            };
            if let Some(account) = partition.account {
                if !accounts.iter().any(|a| a.id == account.id) {
                    accounts.push(account);
                }
            }
        }

        accounts.sort_by(|a, b| a.username.cmp(&b.username));
        debug!(count = accounts.len(), "Listed cached accounts");
        Ok(accounts)
    }

    pub async fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.accounts().await?.into_iter().find(|a| &a.id == id))
    }

    pub async fn find_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts()
            .await?
            .into_iter()
            .find(|a| a.username.eq_ignore_ascii_case(username)))
    }

    /// Removes every partition belonging to `account`. Returns how many were
    /// removed.
    pub async fn invalidate(&self, account: &AccountId) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let prefix = format!("{}{}|", KEY_PREFIX, account);
        let mut removed = 0;

        for key in self.partition_keys().await? {
            if key.starts_with(&prefix) {
                self.secure_store
                    .delete_secret(&key)
                    .await
                    .map_err(AuthError::from_storage)?;
                removed += 1;
            }
        }

        info!(account_id = %account, partitions = removed, "Cache invalidated for account");
        Ok(removed)
    }

    /// Removes every cache partition. Other secrets in the store are untouched.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        for key in self.partition_keys().await? {
            self.secure_store
                .delete_secret(&key)
                .await
                .map_err(AuthError::from_storage)?;
        }
        info!("Token cache cleared");
        Ok(())
    }

    async fn partition_keys(&self) -> Result<Vec<String>> {
        let keys = self.secure_store.list_keys().await.map_err(|e| {
            warn!(error = %e, "Failed to list keys from secure storage");
            AuthError::from_storage(e)
        })?;
        Ok(keys.into_iter().filter(|k| k.starts_with(KEY_PREFIX)).collect())
    }

    async fn load(&self, key: &str) -> Result<Option<CachePartition>> {
        let data = self.secure_store.get_secret(key).await.map_err(|e| {
            warn!(error = %e, "Failed to read token cache partition");
            AuthError::from_storage(e)
        })?;

        let Some(data) = data else {
            return Ok(None);
        };

        match serde_json::from_slice::<CachePartition>(&data) {
            Ok(partition) if partition.version == PARTITION_VERSION => Ok(Some(partition)),
            Ok(partition) => {
                warn!(version = partition.version, "Discarding cache partition with unknown version");
                self.discard(key).await;
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "Cache partition is corrupted, discarding");
                self.discard(key).await;
                Ok(None)
            }
        }
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.secure_store.delete_secret(key).await {
            warn!(error = %e, "Failed to delete corrupted cache partition");
        }
    }

    async fn save(&self, key: &str, partition: &CachePartition) -> Result<()> {
        if partition.is_empty() {
            return self
                .secure_store
                .delete_secret(key)
                .await
                .map_err(AuthError::from_storage);
        }

        let json = serde_json::to_vec(partition)?;
        self.secure_store.set_secret(key, &json).await.map_err(|e| {
            warn!(error = %e, "Failed to write token cache partition");
            AuthError::from_storage(e)
        })
    }
}
