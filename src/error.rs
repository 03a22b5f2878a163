//! Error taxonomy for the device pipeline.
//!
//! Every error that can surface through an operation's completion or a
//! background-exception event is a variant here. Transports and stages
//! produce them; the retry stage consumes [`DeviceError::is_retryable`].

use thiserror::Error;

/// Errors produced by the pipeline and its transports.
///
/// Variants are `Clone` because a single failure (for example a failed
/// connect) can complete several coalesced operations.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// The operation was cancelled before it could complete.
    #[error("operation cancelled")]
    OperationCancelled,

    /// A connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("connection dropped: {0}")]
    ConnectionDropped(String),

    /// The operation requires a connection and auto-connect is disabled.
    #[error("not connected")]
    NotConnected,

    /// The credential was rejected. Not recoverable without a new one.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A transport-layer failure. `transient` failures are eligible for
    /// retry with backoff; others propagate to the caller.
    #[error("protocol client error: {message}")]
    ProtocolClient { message: String, transient: bool },

    /// The operation timed out waiting for a response.
    #[error("operation timed out")]
    Timeout,

    /// An internal pipeline contract was violated. Fatal to the offending
    /// operation only, never to the pipeline.
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

impl DeviceError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(sanitize_error_message(&message.into()))
    }

    pub fn connection_dropped(message: impl Into<String>) -> Self {
        Self::ConnectionDropped(sanitize_error_message(&message.into()))
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(sanitize_error_message(&message.into()))
    }

    pub fn protocol(message: impl Into<String>, transient: bool) -> Self {
        Self::ProtocolClient {
            message: sanitize_error_message(&message.into()),
            transient,
        }
    }

    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline(message.into())
    }

    /// Whether the retry stage may resubmit an operation that failed with
    /// this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::ConnectionDropped(_)
                | DeviceError::NotConnected
                | DeviceError::Timeout
                | DeviceError::ProtocolClient { transient: true, .. }
        )
    }
}

/// Strip credential material out of error text before it can reach logs or
/// callers. SAS tokens embed signatures, and transports echo connection
/// parameters into their errors.
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    sanitized = regex::Regex::new(
        r"(?i)(password|token|key|secret|sig|SharedAccessSignature)[=:]\s*[^\s&]+",
    )
    .unwrap()
    .replace_all(&sanitized, "${1}=***")
    .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let max_content_len = 500 - truncate_suffix.len();
        sanitized = format!("{}{}", &sanitized[..max_content_len], truncate_suffix);
    }

    sanitized
}

/// Result type for device pipeline operations.
pub type DeviceResult<T> = Result<T, DeviceError>;
