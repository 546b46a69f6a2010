//! Cloud API error types.

use thiserror::Error;

/// Error returned by a cloud API call.
///
/// Keeps the HTTP status, service error code and message so the retry
/// classifier can decide what to do with it.
#[derive(Clone, Debug, Error)]
pub enum CloudError {
    #[error("{op}: service error {}: {message}", code.as_deref().unwrap_or("<no code>"))]
    Service {
        op: &'static str,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("{op}: send request failed: {message}")]
    Network { op: &'static str, message: String },

    #[error("{op}: credentials error: {message}")]
    Credentials { op: &'static str, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{op}: {message}")]
    Other { op: &'static str, message: String },
}

impl CloudError {
    pub fn service(
        op: &'static str,
        status: Option<u16>,
        code: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::Service {
            op,
            status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn not_found(op: &'static str, what: &str) -> Self {
        Self::service(op, Some(404), Some("NoSuchKey"), format!("not found: {what}"))
    }

    pub fn forbidden(op: &'static str) -> Self {
        Self::service(op, Some(403), Some("AccessDenied"), "Access Denied")
    }

    pub fn throttled(op: &'static str) -> Self {
        Self::service(op, Some(503), Some("SlowDown"), "Please reduce your request rate.")
    }

    pub fn expired_token(op: &'static str) -> Self {
        Self::service(
            op,
            Some(400),
            Some("ExpiredToken"),
            "The security token included in the request is expired",
        )
    }

    pub fn network(op: &'static str, message: impl Into<String>) -> Self {
        Self::Network {
            op,
            message: message.into(),
        }
    }

    /// Operation name the error was raised by.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Service { op, .. }
            | Self::Network { op, .. }
            | Self::Credentials { op, .. }
            | Self::Other { op, .. } => op,
            Self::Config(_) => "config",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => *status,
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Service { message, .. }
            | Self::Network { message, .. }
            | Self::Credentials { message, .. }
            | Self::Other { message, .. } => message,
            Self::Config(message) => message,
        }
    }
}

/// Result type for cloud API calls.
pub type CloudResult<T> = std::result::Result<T, CloudError>;
