//! Error taxonomy shared by the core and application crates.
//!
//! Every fallible core operation returns [`Result`]. Callers that need to
//! decide whether a failure is worth retrying use [`FusionError::is_retryable`]
//! instead of matching on message strings.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why an image reference was rejected by the image processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRejection {
    /// The URL could not be fetched (DNS, connection, timeout).
    Unreachable(String),
    /// The server answered with a non-success status.
    HttpStatus(u16),
    /// The response was not declared as `image/*`.
    NotAnImage(String),
    /// The bytes do not look like any supported image format.
    Corrupt,
    /// The body exceeded the configured size ceiling.
    TooLarge(usize),
}

impl fmt::Display for ImageRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRejection::Unreachable(reason) => write!(f, "unreachable: {}", reason),
            ImageRejection::HttpStatus(code) => write!(f, "http status {}", code),
            ImageRejection::NotAnImage(ct) => write!(f, "content type '{}' is not an image", ct),
            ImageRejection::Corrupt => write!(f, "unrecognized image bytes"),
            ImageRejection::TooLarge(n) => write!(f, "body larger than {} bytes", n),
        }
    }
}

/// Which rate window ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    RequestsPerMinute,
    TokensPerMinute,
    RequestsPerDay,
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RateWindow::RequestsPerMinute => "requests per minute",
            RateWindow::TokensPerMinute => "tokens per minute",
            RateWindow::RequestsPerDay => "requests per day",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("invalid image url {url}: {reason}")]
    InvalidImageUrl { url: String, reason: ImageRejection },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid weight for {field}: {value}")]
    InvalidWeight { field: String, value: f32 },

    #[error("rate budget exhausted ({window}), resets in {retry_after:?}")]
    RateBudgetExhausted {
        window: RateWindow,
        retry_after: Duration,
    },

    #[error("{operation} timed out after {after:?}")]
    ExternalCallTimeout { operation: String, after: Duration },

    #[error("{operation} failed: {reason}")]
    ExternalCallFailure {
        operation: String,
        reason: String,
        retryable: bool,
    },

    #[error("illegal classification transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl FusionError {
    /// Transient failures that a retry may fix.
    ///
    /// Timeouts and failures explicitly marked retryable qualify. An
    /// unreachable image host is retryable; a wrong content type is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FusionError::ExternalCallTimeout { .. } => true,
            FusionError::ExternalCallFailure { retryable, .. } => *retryable,
            FusionError::InvalidImageUrl { reason, .. } => matches!(
                reason,
                ImageRejection::Unreachable(_) | ImageRejection::HttpStatus(429 | 500..=599)
            ),
            _ => false,
        }
    }

    /// Shorthand for a failed external call.
    pub fn external(operation: impl Into<String>, reason: impl Into<String>, retryable: bool) -> Self {
        FusionError::ExternalCallFailure {
            operation: operation.into(),
            reason: reason.into(),
            retryable,
        }
    }
}

pub type Result<T> = std::result::Result<T, FusionError>;
