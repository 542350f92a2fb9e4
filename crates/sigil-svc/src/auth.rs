//! Identity verification and the custody-key side channel
//!
//! The hub never sees end-user credentials directly: a bearer token is
//! handed to the configured [`AuthProvider`], which resolves it to a stable
//! user identifier. Request headers prefixed `M-` carry out-of-band values,
//! most importantly `M-METADATA`, the client-held custody key, and are
//! propagated into the request under their lowercased suffix.

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::BTreeMap;

use crate::error::{Result, SvcError};

/// Resolves a bearer token to the authenticated user's identifier
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn user_id(&self, bearer: &str) -> Result<String>;
}

/// Delegates identity checks to an external HTTP endpoint: the bearer is
/// forwarded and a 200 response body is taken as the user identifier.
pub struct WebhookAuth {
    client: reqwest::Client,
    url: String,
}

impl WebhookAuth {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for WebhookAuth {
    async fn user_id(&self, bearer: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| SvcError::Internal(format!("auth webhook unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(SvcError::Unauthorized);
        }
        let user_id = response
            .text()
            .await
            .map_err(|e| SvcError::Internal(format!("auth webhook body: {e}")))?;
        if user_id.is_empty() {
            return Err(SvcError::Unauthorized);
        }
        Ok(user_id)
    }
}

/// Fixed bearer → user mapping, for development deployments and tests
pub struct StaticAuth {
    users: BTreeMap<String, String>,
}

impl StaticAuth {
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            users: pairs
                .into_iter()
                .map(|(bearer, user)| (bearer.into(), user.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn user_id(&self, bearer: &str) -> Result<String> {
        self.users
            .get(bearer)
            .cloned()
            .ok_or(SvcError::Unauthorized)
    }
}

/// Extract the bearer token from an `Authorization` header
pub fn bearer_from_headers(headers: &HeaderMap) -> Result<String> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(SvcError::Unauthorized)?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    if token.is_empty() {
        return Err(SvcError::Unauthorized);
    }
    Ok(token.to_string())
}

const CUSTODY_HEADER_PREFIX: &str = "m-";

/// Values carried by `M-*` request headers, keyed by lowercased suffix
#[derive(Debug, Clone, Default)]
pub struct CustodyHeaders(pub BTreeMap<String, String>);

impl CustodyHeaders {
    pub fn metadata(&self) -> Option<&str> {
        self.0.get("metadata").map(String::as_str)
    }
}

/// Middleware copying every `M-*` header into a [`CustodyHeaders`] extension
pub async fn custody_headers(mut request: Request, next: Next) -> Response {
    let mut values = BTreeMap::new();
    for (name, value) in request.headers() {
        let name = name.as_str();
        if let Some(suffix) = name
            .to_ascii_lowercase()
            .strip_prefix(CUSTODY_HEADER_PREFIX)
        {
            if let Ok(text) = value.to_str() {
                values.insert(suffix.to_string(), text.to_string());
            }
        }
    }
    request.extensions_mut().insert(CustodyHeaders(values));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn static_auth_resolves_known_bearers() {
        let auth = StaticAuth::new([("b", "u")]);
        assert_eq!(auth.user_id("b").await.unwrap(), "u");
        assert!(matches!(
            auth.user_id("other").await,
            Err(SvcError::Unauthorized)
        ));
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_from_headers(&headers).unwrap(), "abc");

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert!(bearer_from_headers(&headers).is_err());

        let empty = HeaderMap::new();
        assert!(bearer_from_headers(&empty).is_err());
    }
}
