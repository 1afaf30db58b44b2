//! HTTP Client Abstraction
//!
//! Request/response types for the discovery and token endpoint calls made by
//! the core. Transport (TLS, pooling, proxies) belongs to the host.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BridgeError, Result};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// An outgoing request. The core only ever issues JSON `GET`s (discovery)
/// and form-encoded `POST`s (token endpoint).
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    /// Per-request deadline the host transport should apply.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// `GET` expecting a JSON document.
    pub fn get_json(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url).header("Accept", JSON_CONTENT_TYPE)
    }

    /// `POST` of `params` as an `application/x-www-form-urlencoded` body,
    /// expecting JSON back.
    pub fn post_form<T: Serialize + ?Sized>(url: impl Into<String>, params: &T) -> Result<Self> {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|e| BridgeError::OperationFailed(format!("Form encoding failed: {}", e)))?;

        let mut request = Self::new(HttpMethod::Post, url)
            .header("Accept", JSON_CONTENT_TYPE)
            .header("Content-Type", FORM_CONTENT_TYPE);
        request.body = Some(Bytes::from(encoded));
        Ok(request)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Decode the form body back into key/value pairs.
    ///
    /// Mostly useful to test doubles that need to inspect token requests.
    pub fn form_params(&self) -> HashMap<String, String> {
        self.body
            .as_ref()
            .and_then(|body| serde_urlencoded::from_bytes(body).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Build a response with a JSON body, mainly for hosts and test doubles.
    pub fn json_body(status: u16, body: &serde_json::Value) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), JSON_CONTENT_TYPE.to_string());
        Self {
            status,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            BridgeError::OperationFailed(format!("JSON deserialization failed: {}", e))
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 5xx and 429: the server may answer differently if asked again.
    pub fn is_retryable(&self) -> bool {
        self.status == 429 || (500..600).contains(&self.status)
    }
}

/// Host-provided HTTP transport.
///
/// Implementations own TLS validation, connection pooling and proxy support.
/// They should honour [`HttpRequest::timeout`] when set and must not retry on
/// their own: retry policy for token requests lives in the core.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest};
///
/// async fn fetch_metadata(client: &dyn HttpClient) -> Result<serde_json::Value> {
///     let request = HttpRequest::get_json(
///         "https://login.example.com/tenant/.well-known/openid-configuration",
///     );
///     client.execute(request).await?.json()
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Returns an error only for transport failures (connection, TLS,
    /// timeout). Non-2xx statuses come back as a response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_json_request() {
        let request = HttpRequest::get_json("https://example.com/.well-known/openid-configuration")
            .timeout(Duration::from_secs(30));

        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.headers.get("Accept"), Some(&"application/json".to_string()));
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
        assert!(request.body.is_none());
    }

    #[test]
    fn test_form_body_is_encoded_and_decodable() {
        let params = [("grant_type", "refresh_token"), ("scope", "a b")];
        let request = HttpRequest::post_form("https://example.com/token", &params).unwrap();

        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(
            request.headers.get("Content-Type"),
            Some(&"application/x-www-form-urlencoded".to_string())
        );
        let decoded = request.form_params();
        assert_eq!(decoded.get("grant_type"), Some(&"refresh_token".to_string()));
        assert_eq!(decoded.get("scope"), Some(&"a b".to_string()));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(HttpResponse::json_body(503, &serde_json::json!({})).is_retryable());
        assert!(HttpResponse::json_body(429, &serde_json::json!({})).is_retryable());
        assert!(!HttpResponse::json_body(400, &serde_json::json!({})).is_retryable());
        assert!(HttpResponse::json_body(204, &serde_json::json!({})).is_success());
    }

    #[test]
    fn test_json_body_parses() {
        let response = HttpResponse::json_body(400, &serde_json::json!({"error": "invalid_grant"}));
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["error"], "invalid_grant");
        assert!(!response.is_success());
    }
}
