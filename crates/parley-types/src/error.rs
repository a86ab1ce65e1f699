use std::fmt;

use thiserror::Error;

/// Coarse classification of non-401 HTTP failures. Used for logging only;
/// none of these trigger retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    Validation,
    RateLimited,
    Server,
    BadGateway,
    Unavailable,
    Other,
}

impl StatusClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            422 => Self::Validation,
            429 => Self::RateLimited,
            500 => Self::Server,
            502 => Self::BadGateway,
            503 => Self::Unavailable,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BadRequest => "bad request",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Validation => "validation error",
            Self::RateLimited => "too many requests",
            Self::Server => "server error",
            Self::BadGateway => "bad gateway",
            Self::Unavailable => "service unavailable",
            Self::Other => "http error",
        };
        f.write_str(label)
    }
}

/// Everything a REST call can fail with.
///
/// `Clone` so a single refresh failure can be handed to every queued request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// The caller (or a bulk cancel) aborted the request. Not a failure.
    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("{class} ({status}): {message}")]
    Status {
        status: u16,
        class: StatusClass,
        message: String,
    },

    /// Credential rejected and could not be refreshed; the session has ended.
    #[error("session expired: {0}")]
    Unauthorized(String),

    /// No credential available for an authenticated call.
    #[error("not signed in")]
    NotAuthenticated,

    /// The server answered 2xx but embedded a failure in the envelope.
    #[error("{0}")]
    Application(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("credential store: {0}")]
    Store(String),
}

impl ApiError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            class: StatusClass::from_status(status),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Unauthorized(_) => Some(401),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
