//! Secure Credential Storage Abstraction
//!
//! The token cache persists its partitions through this trait. The host decides
//! where bytes end up (Keychain, Keystore, DPAPI, Secret Service).

use async_trait::async_trait;

use crate::error::Result;

/// Opaque key/blob store backed by the platform's credential vault.
///
/// Values are serialized cache partitions that contain refresh tokens, so
/// implementations must encrypt at rest and must never log them. Keys are
/// plain ASCII and carry no secrets.
///
/// ```ignore
/// use bridge_traits::storage::SecureStore;
///
/// async fn store_blob(store: &dyn SecureStore, blob: &[u8]) -> Result<()> {
///     store.set_secret("authcache.v1.account.host", blob).await
/// }
/// ```
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Replaces any previous value under `key`.
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()>;

    /// `Ok(None)` when the key is absent.
    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing key succeeds.
    async fn delete_secret(&self, key: &str) -> Result<()>;

    /// Every key currently held, including ones written by other components.
    async fn list_keys(&self) -> Result<Vec<String>>;
}
