/// Safe response decoding
///
/// Turns a raw HTTP response into a `FetchOutcome<Value>`. No input makes it
/// panic or return an error; every failure becomes a `Failure` with a fixed
/// user message, and the raw material goes to the diagnostic sink.
use crate::diagnostics::{DiagnosticContext, DiagnosticKind};
use crate::outcome::{
    body_excerpt, user_message_for_status, FetchErrorKind, FetchOutcome, MSG_NETWORK, MSG_PARSE,
    MSG_TIMEOUT,
};
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Result of reading a response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyRead {
    Text(String),
    Failed(String),
}

/// Transport-independent view of an HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: BodyRead,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: None,
            content_length: None,
            body: BodyRead::Text(body.into()),
        }
    }

    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, body).with_content_type("application/json")
    }

    pub fn no_content() -> Self {
        Self::new(204, "")
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn with_read_failure(mut self, reason: impl Into<String>) -> Self {
        self.body = BodyRead::Failed(reason.into());
        self
    }

    fn declares_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }
}

/// Decoder bound to a diagnostic context
#[derive(Debug, Clone)]
pub struct SafeResponseDecoder {
    diagnostics: DiagnosticContext,
}

impl SafeResponseDecoder {
    pub fn new(diagnostics: DiagnosticContext) -> Self {
        Self { diagnostics }
    }

    pub fn diagnostics(&self) -> &DiagnosticContext {
        &self.diagnostics
    }

    /// Decode a response received from `source_url`
    pub fn decode(&self, response: RawResponse, source_url: &str) -> FetchOutcome<Value> {
        let status = response.status;

        if !(200..=299).contains(&status) {
            let excerpt = match &response.body {
                BodyRead::Text(text) => body_excerpt(text),
                BodyRead::Failed(reason) => format!("<body read failed: {}>", reason),
            };
            let kind = if status == 0 {
                FetchErrorKind::Network
            } else {
                FetchErrorKind::Http
            };
            let detail = format!(
                "status={} source={} body={}",
                status, source_url, excerpt
            );
            return self.fail(source_url, status, kind, user_message_for_status(status), detail);
        }

        if status == 204 || response.content_length == Some(0) {
            debug!(target: "decoder", source = %source_url, status, "Empty response");
            return FetchOutcome::success(Value::Null, status);
        }

        let declares_json = response.declares_json();
        let text = match response.body {
            BodyRead::Text(text) => text,
            BodyRead::Failed(reason) => {
                self.diagnostics.report(
                    source_url,
                    DiagnosticKind::BodyReadFailed,
                    Some(status),
                    format!(
                        "status={} source={} body read failed, treated as empty: {}",
                        status, source_url, reason
                    ),
                );
                return FetchOutcome::success(Value::Null, status);
            }
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            debug!(target: "decoder", source = %source_url, status, "Blank response body");
            return FetchOutcome::success(Value::Null, status);
        }

        if declares_json || trimmed.starts_with('{') || trimmed.starts_with('[') {
            return match serde_json::from_str::<Value>(trimmed) {
                Ok(data) => FetchOutcome::success(data, status),
                Err(e) => {
                    let detail = format!(
                        "status={} source={} parse error: {} body={}",
                        status,
                        source_url,
                        e,
                        body_excerpt(&text)
                    );
                    self.fail(source_url, status, FetchErrorKind::Parse, MSG_PARSE, detail)
                }
            };
        }

        // Plain-text endpoints are legitimate
        FetchOutcome::success(Value::String(text), status)
    }

    /// Wrap a failure that happened before any response arrived
    pub fn transport_failure(&self, error: &TransportError, source_url: &str) -> FetchOutcome<Value> {
        let detail = format!("source={} transport error: {}", source_url, error);
        match error {
            TransportError::Timeout(_) => {
                self.fail(source_url, 408, FetchErrorKind::Http, MSG_TIMEOUT, detail)
            }
            TransportError::Connect(_) | TransportError::Request(_) => {
                self.fail(source_url, 0, FetchErrorKind::Network, MSG_NETWORK, detail)
            }
        }
    }

    fn fail(
        &self,
        source_url: &str,
        status: u16,
        kind: FetchErrorKind,
        user_message: &str,
        detail: String,
    ) -> FetchOutcome<Value> {
        self.diagnostics
            .report(source_url, DiagnosticKind::Fetch(kind), Some(status), detail.clone());
        FetchOutcome::failure(status, kind, user_message, detail)
    }
}

/// How a source lays out its records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordShape {
    /// An array of records
    #[default]
    List,
    /// A two-element array `[main, meta]`
    MainWithMeta,
    /// One object, not bulk-scoped
    Single,
}

/// Records extracted from a decoded payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecords {
    pub records: Vec<Value>,
    pub meta: Option<Value>,
    /// Set when the payload had a shape no record could be taken from
    pub unexpected: bool,
    /// Set when a `[main, meta]` pair had a single object as `main`, so the
    /// pair may just as well be a list of two records
    pub object_pair: bool,
}

impl NormalizedRecords {
    /// Move `meta` back into the records when it looks like one.
    ///
    /// Only applies to object pairs. Returns true when the meta was reclaimed.
    pub fn reclaim_meta(&mut self, is_record: impl Fn(&Value) -> bool) -> bool {
        if !self.object_pair || !self.meta.as_ref().is_some_and(|m| is_record(m)) {
            return false;
        }
        self.records.extend(self.meta.take());
        self.object_pair = false;
        true
    }
}

/// Extract the record list from a decoded payload according to `shape`.
pub fn normalize_records(data: Value, shape: RecordShape) -> NormalizedRecords {
    match (shape, data) {
        (_, Value::Null) => NormalizedRecords::default(),
        (RecordShape::MainWithMeta, Value::Array(mut items))
            if items.len() == 2 && !items[0].is_null() =>
        {
            let meta = items.pop();
            let main = items.pop().unwrap_or(Value::Null);
            let object_pair = main.is_object();
            let mut normalized = normalize_records(main, RecordShape::List);
            normalized.meta = meta;
            normalized.object_pair = object_pair;
            normalized
        }
        (_, Value::Array(items)) => NormalizedRecords {
            records: items,
            meta: None,
            unexpected: false,
            object_pair: false,
        },
        (_, object @ Value::Object(_)) => NormalizedRecords {
            records: vec![object],
            meta: None,
            unexpected: false,
            object_pair: false,
        },
        (_, _) => NormalizedRecords {
            records: Vec::new(),
            meta: None,
            unexpected: true,
            object_pair: false,
        },
    }
}
