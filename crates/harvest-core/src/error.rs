use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control-plane and infrastructure errors for Harvest.
#[derive(Error, Debug)]
pub enum AppError {
    /// The remote API answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The external session does not permit the requested phase.
    #[error("Session error: {0}")]
    SessionError(String),

    /// Extractor setup/teardown failed.
    #[error("Extractor error: {0}")]
    ExtractorError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if the receiver rejected our credentials or payload
    /// permanently (401 / 422). Such a path must never be retried.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            AppError::HttpStatus {
                status: 401 | 422,
                ..
            }
        )
    }

    /// HTTP status code, if this error carries one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Lower-case markers of an environment that is no longer usable (the browser
/// or runtime underneath the extractor is gone), as opposed to a page that
/// merely failed.
pub const RUNTIME_FAILURE_SIGNATURES: &[&str] = &[
    "cannot switch to a different thread",
    "event loop is closed",
    "thread affinity",
    "browser has disconnected",
    "browser process exited",
    "websocket connection closed",
    "runtime is shutting down",
];

/// Typed failure of a single extraction or page scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// Navigation did not finish within the timeout.
    #[error("Navigation timeout after {0} ms")]
    NavTimeout(u64),

    /// The page answered with a non-success status.
    #[error("HTTP {0}")]
    HttpStatus(u16),

    /// A required DOM indicator or selector was not present.
    #[error("Selector not found: {0}")]
    SelectorNotFound(String),

    /// Connection-level failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The execution environment itself is corrupted.
    #[error("Internal runtime error: {0}")]
    Runtime(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl ExtractError {
    /// Classify an opaque error message coming from a lower layer.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if RUNTIME_FAILURE_SIGNATURES.iter().any(|m| lower.contains(m)) {
            return ExtractError::Runtime(message);
        }
        if lower.contains("timeout") || lower.contains("timed out") {
            return ExtractError::NavTimeout(0);
        }
        if lower.contains("403") || lower.contains("forbidden") {
            return ExtractError::HttpStatus(403);
        }
        if lower.contains("404") {
            return ExtractError::HttpStatus(404);
        }
        if lower.contains("selector") || lower.contains("not found") {
            return ExtractError::SelectorNotFound(message);
        }
        if lower.contains("network") || lower.contains("connection") {
            return ExtractError::Network(message);
        }
        ExtractError::Other(message)
    }

    /// True for the fail-fast class: the run cannot continue.
    pub fn is_environment_failure(&self) -> bool {
        match self {
            ExtractError::Runtime(_) => true,
            ExtractError::Other(msg) | ExtractError::Network(msg) => {
                let lower = msg.to_lowercase();
                RUNTIME_FAILURE_SIGNATURES.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }

    /// True if a navigation retry is allowed (timeouts only).
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExtractError::NavTimeout(_))
    }

    /// Stable error code reported to the Store.
    pub fn code(&self) -> ErrorCode {
        match self {
            ExtractError::NavTimeout(_) => ErrorCode::NavTimeout,
            ExtractError::HttpStatus(403) => ErrorCode::Http403,
            ExtractError::HttpStatus(404) => ErrorCode::Http404,
            ExtractError::HttpStatus(_) => ErrorCode::Unknown,
            ExtractError::SelectorNotFound(_) => ErrorCode::SelectorNotFound,
            ExtractError::Network(_) => ErrorCode::NetworkError,
            ExtractError::Runtime(_) => ErrorCode::InternalRuntimeError,
            ExtractError::Other(_) => ErrorCode::Unknown,
        }
    }
}

/// Stable per-task error codes understood by the Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NavTimeout,
    SelectorNotFound,
    PriceParseFailed,
    #[serde(rename = "HTTP_403")]
    Http403,
    #[serde(rename = "HTTP_404")]
    Http404,
    NetworkError,
    Unknown,
    InternalRuntimeError,
    SaveError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NavTimeout => "NAV_TIMEOUT",
            ErrorCode::SelectorNotFound => "SELECTOR_NOT_FOUND",
            ErrorCode::PriceParseFailed => "PRICE_PARSE_FAILED",
            ErrorCode::Http403 => "HTTP_403",
            ErrorCode::Http404 => "HTTP_404",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::InternalRuntimeError => "INTERNAL_RUNTIME_ERROR",
            ErrorCode::SaveError => "SAVE_ERROR",
        }
    }

    /// Permanent page errors: the Store should stop scheduling the URL.
    pub fn is_blocking(&self) -> bool {
        matches!(self, ErrorCode::Http403 | ErrorCode::Http404)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
