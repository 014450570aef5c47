// Source configuration and per-source state
use crate::decoder::RecordShape;
use crate::transport::{HttpMethod, SourceRequest};
use crate::{Result, VigilError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const MIN_INTERVAL_SECS: u64 = 5;
pub const MAX_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_INTERVAL_SECS: u64 = 30;

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

/// One polled webhook endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub shape: RecordShape,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            method: HttpMethod::Get,
            payload: None,
            interval_secs: DEFAULT_INTERVAL_SECS,
            shape: RecordShape::List,
        }
    }

    pub fn with_post(mut self, payload: Value) -> Self {
        self.method = HttpMethod::Post;
        self.payload = Some(payload);
        self
    }

    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_shape(mut self, shape: RecordShape) -> Self {
        self.shape = shape;
        self
    }

    /// Polling period, clamped to the supported range
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS))
    }

    pub fn request(&self) -> SourceRequest {
        SourceRequest {
            url: self.url.clone(),
            method: self.method,
            payload: self.payload.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(VigilError::InvalidSource {
                name: self.name.clone(),
                reason: "name is empty".to_string(),
            });
        }
        let url = reqwest::Url::parse(&self.url).map_err(|e| VigilError::InvalidSource {
            name: self.name.clone(),
            reason: format!("invalid url {}: {}", self.url, e),
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(VigilError::InvalidSource {
                name: self.name.clone(),
                reason: format!("unsupported url: {}", self.url),
            });
        }
        Ok(())
    }
}

/// Connectivity and error state of one source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    pub last_updated: Option<DateTime<Utc>>,
    pub connected: bool,
    pub last_error: Option<String>,
    pub in_flight: bool,
}

/// Fetch lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePhase {
    #[default]
    Idle,
    Loading,
    Ready,
    Errored,
    SilentRefreshing,
}

/// What a view sees of a source
#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot<O> {
    pub data: Option<O>,
    pub loading: bool,
    pub phase: SourcePhase,
    pub error: Option<String>,
    pub connected: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl<O> Default for SourceSnapshot<O> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            phase: SourcePhase::Idle,
            error: None,
            connected: false,
            last_updated: None,
        }
    }
}
