//! ID token and client-info decoding.
//!
//! The ID token is only read for account identity (subject, tenant, username).
//! Its signature is not verified: it arrives over TLS straight from the token
//! endpoint and is never used to authorize anything.

use crate::error::{AuthError, Result};
use crate::types::{Account, AccountId, Authority};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Claims read from an ID token payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub nonce: Option<String>,
}

impl IdTokenClaims {
    /// Decodes the payload segment of a compact JWT.
    pub fn decode(raw: &str) -> Result<Self> {
        let mut parts = raw.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => {
                return Err(AuthError::InvalidIdToken(
                    "expected three dot-separated segments".to_string(),
                ))
            }
        };

        let claims: IdTokenClaims = decode_segment(payload).map_err(AuthError::InvalidIdToken)?;

        if claims.sub.is_empty() {
            return Err(AuthError::InvalidIdToken("empty subject".to_string()));
        }

        Ok(claims)
    }

    /// `oid` when the issuer provides one, otherwise `sub`.
    pub fn object_id(&self) -> &str {
        self.oid.as_deref().unwrap_or(&self.sub)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }

    pub fn username(&self) -> String {
        self.preferred_username
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_default()
    }

    /// Home-account id, preferring `client_info` when the token endpoint
    /// returned one.
    pub fn account_id(&self, client_info: Option<&ClientInfo>) -> AccountId {
        match client_info {
            Some(info) => AccountId::from_parts(&info.uid, Some(&info.utid)),
            None => AccountId::from_parts(self.object_id(), self.tid.as_deref()),
        }
    }

    pub fn to_account(&self, authority: &Authority, client_info: Option<&ClientInfo>) -> Account {
        Account {
            id: self.account_id(client_info),
            username: self.username(),
            display_name: self.name.clone(),
            home_authority: authority.as_str().to_string(),
            tenant_id: client_info
                .map(|info| info.utid.clone())
                .or_else(|| self.tid.clone()),
        }
    }

    /// Checks the `nonce` claim against the one sent with the authorization
    /// request. Tokens without the claim are accepted.
    pub fn verify_nonce(&self, expected: &str) -> Result<()> {
        match self.nonce.as_deref() {
            Some(nonce) if nonce != expected => Err(AuthError::InvalidIdToken(
                "nonce does not match the authorization request".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether the token's issuer is consistent with the advertised issuer.
    ///
    /// Multi-tenant discovery documents advertise `{tenantid}` in place of the
    /// tenant; it is substituted with the token's `tid` before comparing.
    pub fn issuer_matches(&self, advertised: &str) -> bool {
        let expected = match self.tid.as_deref() {
            Some(tid) => advertised.replace("{tenantid}", tid),
            None => advertised.to_string(),
        };
        self.iss.trim_end_matches('/') == expected.trim_end_matches('/')
    }
}

/// `client_info` returned alongside tokens by some identity providers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientInfo {
    pub uid: String,
    pub utid: String,
}

impl ClientInfo {
    pub fn decode(raw: &str) -> Result<Self> {
        decode_segment(raw).map_err(|e| AuthError::InvalidIdToken(format!("client_info: {}", e)))
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> std::result::Result<T, String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| format!("invalid base64: {}", e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON: {}", e))
}

/// Builds an unsigned compact JWT from a claims object.
#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}
