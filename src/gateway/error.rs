//! Transport failures between a scoring backend and its provider.

use std::time::Duration;

use thiserror::Error;

/// Identifiers the provider attached to a failed exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Provider error code from the body, e.g. `"rate_limit_exceeded"`.
    pub provider_code: Option<String>,
    /// `x-request-id` response header.
    pub request_id: Option<String>,
}

/// Why a backend call produced no reply text.
///
/// Whether a fresh attempt could succeed is decided here, once, and the
/// sampling orchestrator only ever asks [`ProviderError::is_retryable`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: ErrorContext,
    },

    /// 5xx, or an error body on an otherwise successful exchange.
    #[error("provider unavailable (HTTP {status}): {message}")]
    Unavailable {
        status: u16,
        message: String,
        context: ErrorContext,
    },

    /// Any other non-success status. The request itself is wrong.
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        context: ErrorContext,
    },

    /// The model declined to score.
    #[error("refused: {0}")]
    Refused(String),

    #[error("malformed provider reply: {0}")]
    Malformed(String),

    #[error("request too large: {chars} chars (max {max})")]
    TooLarge { chars: usize, max: usize },

    /// Per-sample deadline elapsed.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::Timeout(_) => true,
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            Self::Rejected { .. }
            | Self::Refused(_)
            | Self::Malformed(_)
            | Self::TooLarge { .. }
            | Self::Config(_) => false,
        }
    }

    /// Short failure code recorded in samples and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable { .. } => "unavailable",
            Self::Rejected { .. } => "rejected",
            Self::Refused(_) => "refused",
            Self::Malformed(_) => "malformed_reply",
            Self::TooLarge { .. } => "too_large",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Config(_) => "config",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::Unavailable { context, .. }
            | Self::Rejected { context, .. } => Some(context),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}
