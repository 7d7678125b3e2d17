//! Error types for the tempmail-sync crate.
//!
//! Three error enums cover the three failure domains:
//!
//! - [`FetchError`]: anything a [`MailProvider`](crate::provider::MailProvider) can fail with.
//!   The cache absorbs these and serves degraded results instead.
//! - [`ExtractionError`]: a single extraction strategy failed. The cascade falls
//!   through to the next strategy.
//! - [`Error`]: what the crate surfaces to its callers.
//!
//! Errors are categorized by their retryability - see [`Error::is_retryable`].

use crate::model::ExtractionMethod;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the crate's public operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration / validation errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid email address format.
    #[error("invalid email format: {email}")]
    InvalidEmailFormat {
        /// The invalid email address.
        email: String,
    },

    /// Invalid configuration provided.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Lookup errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// No mailbox is registered under this token.
    #[error("mailbox not found for token {token}")]
    MailboxNotFound {
        /// The unknown token.
        token: String,
    },

    /// The mailbox exists but holds no mail with this id.
    #[error("mail {mail_id} not found in mailbox {token}")]
    MailNotFound {
        /// The mailbox token.
        token: String,
        /// The unknown mail id.
        mail_id: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Extraction errors (mixed retryability)
    // ─────────────────────────────────────────────────────────────────────────
    /// The final extraction strategy failed.
    #[error("{method} extraction failed")]
    Extraction {
        /// The strategy that failed.
        method: ExtractionMethod,
        /// The underlying strategy error.
        #[source]
        source: ExtractionError,
    },
}

impl Error {
    /// Returns `true` if this error represents a transient failure that might succeed on retry.
    ///
    /// ```
    /// use tempmail_sync::Error;
    ///
    /// let err = Error::MailboxNotFound { token: "abc".into() };
    /// assert!(!err.is_retryable());
    /// ```
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Extraction { source, .. } => source.is_retryable(),

            Error::InvalidEmailFormat { .. }
            | Error::InvalidConfig { .. }
            | Error::MailboxNotFound { .. }
            | Error::MailNotFound { .. } => false,
        }
    }

    /// Returns the error category for metrics/logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidEmailFormat { .. } | Error::InvalidConfig { .. } => {
                ErrorCategory::Configuration
            }
            Error::MailboxNotFound { .. } | Error::MailNotFound { .. } => ErrorCategory::NotFound,
            Error::Extraction { .. } => ErrorCategory::Extraction,
        }
    }

    /// Returns `true` for unknown mailbox tokens and mail ids.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }
}

/// Error categories for metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration or validation errors.
    Configuration,
    /// Unknown mailbox or mail.
    NotFound,
    /// Code extraction failures.
    Extraction,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Extraction => write!(f, "extraction"),
        }
    }
}

/// The single error type every mail provider reports.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// Transport failure (DNS, connect, TLS, timeout, body read).
    #[error("request to {url} failed")]
    Request {
        /// The URL requested, without credentials.
        url: String,
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// The upstream answered with a non-success status.
    #[error("upstream returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// First part of the response body.
        body: String,
    },

    /// The upstream answered but the payload could not be understood.
    #[error("malformed upstream payload: {message}")]
    Payload {
        /// What was wrong with the payload.
        message: String,
    },

    /// The fetch task stopped before producing a result.
    #[error("fetch aborted: {message}")]
    Aborted {
        /// Why the task stopped.
        message: String,
    },
}

impl FetchError {
    /// Returns `true` for timeouts, connection failures, 429 and 5xx responses.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Payload { .. } | FetchError::Aborted { .. } => false,
        }
    }

    /// Builds a [`FetchError::Payload`].
    pub fn payload(message: impl Into<String>) -> Self {
        FetchError::Payload {
            message: message.into(),
        }
    }
}

/// Errors produced by a single extraction strategy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExtractionError {
    /// The strategy is not configured (e.g. LLM disabled or missing API key).
    #[error("{method} extraction is not available")]
    Unavailable {
        /// The unavailable strategy.
        method: ExtractionMethod,
    },

    /// The LLM endpoint could not be reached.
    #[error("LLM request failed")]
    LlmRequest {
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// The LLM endpoint answered with a non-success status.
    #[error("LLM endpoint returned HTTP {status}: {body}")]
    LlmStatus {
        /// HTTP status code.
        status: u16,
        /// First part of the response body.
        body: String,
    },

    /// The LLM answer did not have the expected shape.
    #[error("unexpected LLM response: {message}")]
    LlmResponse {
        /// What was wrong with the response.
        message: String,
    },

    /// A highlighted code does not occur in the mail it was highlighted in.
    #[error("invalid highlight: {message}")]
    InvalidHighlight {
        /// What was wrong with the highlight.
        message: String,
    },

    /// A learned template carried a regex that does not compile.
    #[error("invalid template pattern '{pattern}'")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },
}

impl ExtractionError {
    /// Returns `true` for LLM transport failures, 429 and 5xx responses.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractionError::LlmRequest { .. } => true,
            ExtractionError::LlmStatus { status, .. } => *status == 429 || *status >= 500,
            ExtractionError::Unavailable { .. }
            | ExtractionError::LlmResponse { .. }
            | ExtractionError::InvalidHighlight { .. }
            | ExtractionError::InvalidPattern { .. } => false,
        }
    }
}

/// Truncates an upstream response body for inclusion in an error.
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX_CHARS: usize = 500;
    body.chars().take(MAX_CHARS).collect()
}
