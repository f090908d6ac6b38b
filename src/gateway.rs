//! HTTP request gateway with bearer auth and a single retry after renewal.
//!
//! ARCHITECTURE
//! ============
//! Every outbound call goes through [`Gateway::request`]. An expired
//! credential is renewed before sending; a 401 response triggers one renewal
//! through the shared [`RefreshCoordinator`] and exactly one retry. A second
//! 401 is handed back to the caller unchanged, so a revoked session cannot
//! loop.
//!
//! Responses are returned raw: callers interpret status codes themselves.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::credentials::{Credential, CredentialStore};
use crate::refresh::{RefreshCoordinator, RefreshError, TokenResponse};

const REQUEST_ID_HEADER: &str = "x-request-id";

// =============================================================================
// ERRORS AND OPTIONS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// Renewal failed; credentials have been cleared.
    #[error("credential refresh failed: {0}")]
    Refresh(#[from] RefreshError),
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything needed to (re)build a request.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get()
    }
}

impl RequestOptions {
    #[must_use]
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_method(method: Method, body: Option<Value>) -> Self {
        Self {
            method,
            body,
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn post(body: Value) -> Self {
        Self::with_method(Method::POST, Some(body))
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Build the shared HTTP client used by the gateway and the token refresher.
///
/// # Errors
///
/// Returns an error when the TLS backend cannot be initialized.
pub fn build_http_client(request_timeout: Duration, connect_timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .connect_timeout(connect_timeout)
        .build()
}

// =============================================================================
// GATEWAY
// =============================================================================

#[derive(Clone)]
pub struct Gateway {
    http: reqwest::Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
    expiry_skew_secs: i64,
}

impl Gateway {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        coordinator: RefreshCoordinator,
        expiry_skew_secs: i64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            store,
            coordinator,
            expiry_skew_secs,
        }
    }

    /// Resolve a path against the API base URL; absolute URLs pass through.
    #[must_use]
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_owned()
        } else if url.starts_with('/') {
            format!("{}{url}", self.base_url)
        } else {
            format!("{}/{url}", self.base_url)
        }
    }

    /// Issue an authenticated request.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Network`] on transport failure and
    /// [`GatewayError::Refresh`] when a required renewal fails.
    pub async fn request(&self, url: &str, options: &RequestOptions) -> Result<Response, GatewayError> {
        let url = self.resolve_url(url);
        let request_id = Uuid::new_v4();

        let mut credential = self.store.get();
        if let Some(current) = &credential
            && current.is_expired(self.expiry_skew_secs)
        {
            tracing::debug!(%url, %request_id, "access token expired; renewing before request");
            credential = Some(self.coordinator.renew(Some(&current.access_token)).await?);
        }

        let response = self.send(&url, options, credential.as_ref(), request_id).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::info!(%url, %request_id, "request unauthorized; renewing credential");
        let rejected = credential.as_ref().map(|c| c.access_token.as_str());
        let renewed = self.coordinator.renew(rejected).await?;

        let retried = self.send(&url, options, Some(&renewed), request_id).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(%url, %request_id, "request still unauthorized after renewal");
        }
        Ok(retried)
    }

    /// Issue a request and decode a successful JSON response.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Status`] for non-2xx responses, plus every
    /// error [`Gateway::request`] can return.
    pub async fn request_json<T: DeserializeOwned>(&self, url: &str, options: &RequestOptions) -> Result<T, GatewayError> {
        let response = self.request(url, options).await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// # Errors
    ///
    /// See [`Gateway::request_json`].
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GatewayError> {
        self.request_json(url, &RequestOptions::get()).await
    }

    /// # Errors
    ///
    /// See [`Gateway::request_json`].
    pub async fn post_json<T: DeserializeOwned>(&self, url: &str, body: Value) -> Result<T, GatewayError> {
        self.request_json(url, &RequestOptions::post(body)).await
    }

    /// Exchange login details for a credential and store it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Status`] when the server rejects the login and
    /// [`GatewayError::Refresh`] when the response carries no tokens.
    pub async fn login(&self, url: &str, body: Value) -> Result<Credential, GatewayError> {
        let url = self.resolve_url(url);
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let credential = serde_json::from_str::<TokenResponse>(&text)?.into_credential(None)?;
        self.store.set(credential.clone());
        tracing::info!(expires_at = ?credential.expires_at, "logged in");
        Ok(credential)
    }

    async fn send(
        &self,
        url: &str,
        options: &RequestOptions,
        credential: Option<&Credential>,
        request_id: Uuid,
    ) -> Result<Response, GatewayError> {
        let mut request = self
            .http
            .request(options.method.clone(), url)
            .header(REQUEST_ID_HEADER, request_id.to_string());
        if let Some(credential) = credential {
            request = request.bearer_auth(&credential.access_token);
        }
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| GatewayError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value).map_err(|_| GatewayError::InvalidHeader(name.to_string()))?;
            request = request.header(name, value);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        tracing::debug!(%url, %request_id, status = response.status().as_u16(), "request completed");
        Ok(response)
    }
}

#[cfg(test)]
#[path = "gateway_test.rs"]
mod tests;
