//! Provider error classification
//!
//! Only an explicit rejection proves the provider did not execute a transfer.
//! Everything else is ambiguous and never authorises compensation.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Provider unambiguously declined the request (validation, funds, ...)
    #[error("Provider rejected request ({status}): {code} - {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Provider request timed out: {0}")]
    Timeout(String),

    /// 5xx or throttling response; execution unknown
    #[error("Provider unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("Provider transport error: {0}")]
    Transport(String),

    #[error("Unexpected provider response: {0}")]
    UnexpectedResponse(String),
}

impl ProviderError {
    /// True only when the response proves the transfer was not executed
    #[inline]
    pub fn is_explicit_rejection(&self) -> bool {
        matches!(self, ProviderError::Rejected { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Rejected { .. } => "PROVIDER_REJECTED",
            ProviderError::Timeout(_) => "PROVIDER_TIMEOUT",
            ProviderError::Unavailable { .. } => "PROVIDER_UNAVAILABLE",
            ProviderError::Transport(_) => "PROVIDER_TRANSPORT",
            ProviderError::UnexpectedResponse(_) => "PROVIDER_UNEXPECTED_RESPONSE",
        }
    }

    /// HTTP statuses whose error body is trusted as proof of non-execution.
    ///
    /// 408 (timeout), 409 (conflict, possibly a duplicate already accepted)
    /// and 429 (throttled mid-flight) are deliberately excluded.
    pub fn is_rejection_status(status: u16) -> bool {
        matches!(status, 400 | 401 | 402 | 403 | 404 | 422)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_decode() {
            ProviderError::UnexpectedResponse(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}
