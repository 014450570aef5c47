/// Fetch outcomes and the user-facing message table
///
/// Every network interaction ends in a `FetchOutcome`. Only `user_message`
/// may ever reach a view; `debug_detail` goes to the diagnostic sink.
use serde::{Deserialize, Serialize};

/// Upper bound on raw body characters copied into debug detail
pub const BODY_EXCERPT_CHARS: usize = 200;

pub const MSG_NETWORK: &str = "network error";
pub const MSG_UNAUTHORIZED: &str = "authentication required";
pub const MSG_FORBIDDEN: &str = "access denied";
pub const MSG_NOT_FOUND: &str = "resource not found";
pub const MSG_TIMEOUT: &str = "request timed out";
pub const MSG_SERVER: &str = "service unavailable";
pub const MSG_DEFAULT: &str = "request failed";
pub const MSG_PARSE: &str = "unexpected response format";

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Transport-level failure (status 0)
    Network,
    /// Non-2xx status
    Http,
    /// 2xx with an undecodable body
    Parse,
    /// 2xx with nothing in it. Not an error, modeled for uniform handling.
    Empty,
}

/// Failure half of a fetch outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub status_code: u16,
    pub kind: FetchErrorKind,
    pub user_message: String,
    #[serde(default, skip_serializing)]
    pub debug_detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    Success { data: T, status_code: u16 },
    Failure(FetchFailure),
}

impl<T> FetchOutcome<T> {
    pub fn success(data: T, status_code: u16) -> Self {
        FetchOutcome::Success { data, status_code }
    }

    pub fn failure(
        status_code: u16,
        kind: FetchErrorKind,
        user_message: impl Into<String>,
        debug_detail: impl Into<String>,
    ) -> Self {
        FetchOutcome::Failure(FetchFailure {
            status_code,
            kind,
            user_message: user_message.into(),
            debug_detail: debug_detail.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }

    pub fn status_code(&self) -> u16 {
        match self {
            FetchOutcome::Success { status_code, .. } => *status_code,
            FetchOutcome::Failure(f) => f.status_code,
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            FetchOutcome::Success { data, .. } => Some(data),
            FetchOutcome::Failure(_) => None,
        }
    }

    pub fn failure_ref(&self) -> Option<&FetchFailure> {
        match self {
            FetchOutcome::Success { .. } => None,
            FetchOutcome::Failure(f) => Some(f),
        }
    }

    /// The only text a view is allowed to render
    pub fn user_message(&self) -> Option<&str> {
        self.failure_ref().map(|f| f.user_message.as_str())
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> FetchOutcome<U> {
        match self {
            FetchOutcome::Success { data, status_code } => FetchOutcome::Success {
                data: f(data),
                status_code,
            },
            FetchOutcome::Failure(failure) => FetchOutcome::Failure(failure),
        }
    }

    pub fn into_result(self) -> Result<T, FetchFailure> {
        match self {
            FetchOutcome::Success { data, .. } => Ok(data),
            FetchOutcome::Failure(f) => Err(f),
        }
    }
}

impl FetchOutcome<serde_json::Value> {
    /// True for a 2xx that carried no payload (204, zero-length, unreadable body)
    pub fn is_empty(&self) -> bool {
        matches!(self, FetchOutcome::Success { data, .. } if data.is_null())
    }

    pub fn kind(&self) -> Option<FetchErrorKind> {
        match self {
            FetchOutcome::Success { data, .. } if data.is_null() => Some(FetchErrorKind::Empty),
            FetchOutcome::Success { .. } => None,
            FetchOutcome::Failure(f) => Some(f.kind),
        }
    }
}

/// Map a status code to its fixed user message. Never reveals internals.
pub fn user_message_for_status(status: u16) -> &'static str {
    match status {
        0 => MSG_NETWORK,
        401 => MSG_UNAUTHORIZED,
        403 => MSG_FORBIDDEN,
        404 => MSG_NOT_FOUND,
        408 => MSG_TIMEOUT,
        500..=599 => MSG_SERVER,
        _ => MSG_DEFAULT,
    }
}

/// First `BODY_EXCERPT_CHARS` characters of a raw body
pub fn body_excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_CHARS).collect()
}
