/// HTTP transport for webhook sources
///
/// The `Transport` trait is the only place the reconciliation core waits on
/// I/O. `HttpTransport` is the reqwest-backed implementation.
use crate::decoder::{BodyRead, RawResponse};
use crate::{Result, VigilError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// A single request against a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRequest {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl SourceRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            payload: None,
        }
    }

    pub fn post(url: impl Into<String>, payload: Value) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            payload: Some(payload),
        }
    }
}

/// Failures before a response status is known
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &SourceRequest,
    ) -> std::result::Result<RawResponse, TransportError>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VigilError::HttpClientError(e.to_string()))?;

        Ok(Self {
            http_client,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn classify(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &SourceRequest,
    ) -> std::result::Result<RawResponse, TransportError> {
        debug!(target: "transport", url = %request.url, method = ?request.method, "Sending request");

        let builder = match request.method {
            HttpMethod::Get => self.http_client.get(&request.url),
            HttpMethod::Post => {
                let builder = self.http_client.post(&request.url);
                match &request.payload {
                    Some(payload) => builder.json(payload),
                    None => builder,
                }
            }
        };

        let response = builder.send().await.map_err(|e| {
            warn!(target: "transport", url = %request.url, error = %e, "Request failed");
            self.classify(e)
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();

        let body = match response.text().await {
            Ok(text) => BodyRead::Text(text),
            Err(e) if e.is_timeout() => return Err(TransportError::Timeout(self.timeout)),
            Err(e) => {
                warn!(target: "transport", url = %request.url, error = %e, "Failed to read body");
                BodyRead::Failed(e.to_string())
            }
        };

        Ok(RawResponse {
            status,
            content_type,
            content_length,
            body,
        })
    }
}
