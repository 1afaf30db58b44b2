//! # Authentication Module
//!
//! Client-side OAuth 2.0 / OpenID Connect token acquisition.
//!
//! ## Overview
//!
//! Applications ask the [`RequestBroker`] for an access token covering a set
//! of scopes. The broker de-duplicates identical concurrent requests and runs
//! the [`AcquisitionStateMachine`], which tries the [`TokenCache`] first,
//! then the refresh token, and finally interactive sign-in through the
//! host's `UiPresenter`. Authority metadata comes from the
//! [`AuthorityResolver`].
//!
//! ## Features
//!
//! - Scope-superset cache matching with lazy eviction of expired tokens
//! - Single retry of transient refresh failures
//! - Authorization code flow with PKCE (S256)
//! - Silent, automatic and interactive policies
//! - Cancellation at every suspension point
//! - Auth state event emission

pub mod acquisition;
pub mod authority;
pub mod broker;
pub mod error;
pub mod id_token;
pub mod oauth;
pub mod token_cache;
pub mod types;

#[cfg(test)]
mod test_support;

pub use acquisition::{
    AcquisitionOutcome, AcquisitionState, AcquisitionStateMachine, AcquisitionTrace, Transition,
};
pub use authority::AuthorityResolver;
pub use broker::RequestBroker;
pub use error::{AuthError, Result};
pub use id_token::{ClientInfo, IdTokenClaims};
pub use oauth::{PkceVerifier, TokenClient, TokenResponse};
pub use token_cache::{CacheLookup, TokenCache};
pub use types::{
    AcquisitionRequest, Account, AccountId, AuthenticationResult, Authority, AuthorityMetadata,
    Credential, CredentialKind, InteractionPolicy, ScopeSet, TokenSource, RESERVED_SCOPES,
};
