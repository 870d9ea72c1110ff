//! HTTP boundary to the API under test.

use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use crate::schema::{AuthConfig, EvaluationConfig};

/// Raw response of one call to the target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetResponse {
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
}

/// Failures below the HTTP layer. None of these abort a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Transport error: {0}")]
    Other(String),
    #[error("Invalid client setup: {0}")]
    Setup(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
}

/// Something that accepts a serialized JSON payload and answers with a status
/// and a body. Each call must be a single request.
pub trait HttpTarget: Send + Sync {
    fn send(&self, body: &[u8]) -> Result<TargetResponse, TransportError>;
}

/// Blocking `reqwest` client POSTing to one endpoint.
pub struct ReqwestTarget {
    client: Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl ReqwestTarget {
    /// Build a client with total and connect timeouts and the configured
    /// headers. No request is issued.
    pub fn new(config: &EvaluationConfig) -> Result<Self, TransportError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Setup(format!("header `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Setup(format!("header `{name}`: {e}")))?;
            headers.insert(name, value);
        }

        Ok(Self {
            client,
            url: config.target_url.clone(),
            headers,
            timeout,
        })
    }

    /// Build the client and log in when `auth` is configured.
    pub fn from_config(config: &EvaluationConfig) -> Result<Self, TransportError> {
        let mut target = Self::new(config)?;
        if let Some(auth) = &config.auth {
            target.authenticate(auth)?;
        }
        Ok(target)
    }

    /// Obtain a bearer token and attach it to every subsequent request.
    pub fn authenticate(&mut self, auth: &AuthConfig) -> Result<(), TransportError> {
        log::info!("Authenticating against {}", auth.token_url);

        let response = self
            .client
            .post(&auth.token_url)
            .json(&auth.credentials)
            .send()
            .map_err(|e| classify(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Auth(format!("login returned HTTP {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .map_err(|e| TransportError::Auth(format!("login response is not JSON: {e}")))?;
        let token = body
            .get(&auth.token_field)
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                TransportError::Auth(format!("login response lacks `{}`", auth.token_field))
            })?;

        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Auth(e.to_string()))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

impl HttpTarget for ReqwestTarget {
    fn send(&self, body: &[u8]) -> Result<TargetResponse, TransportError> {
        let start = Instant::now();

        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .map_err(|e| classify(e, self.timeout))?;

        let status = response.status().as_u16();
        let body = response.text().map_err(|e| classify(e, self.timeout))?;

        Ok(TargetResponse {
            status,
            body,
            elapsed: start.elapsed(),
        })
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
