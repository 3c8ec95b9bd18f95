/// Errors raised by a `ChatTransport` before or while a response body is read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent or the connection failed.
    #[error("request failed: {message}")]
    Request { message: String },
    /// The backend answered with a non-2xx status.
    #[error("request failed with status {status}: {detail}")]
    Status { status: u16, detail: String },
    /// The configured request timeout elapsed.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// The caller aborted the request.
    #[error("request cancelled")]
    Cancelled,
    /// The response did not have the expected shape.
    #[error("protocol error: {message}")]
    Protocol { message: String },
    /// Input rejected before any request was made.
    #[error("validation error: {message}")]
    Validation { message: String },
}

impl TransportError {
    /// Creates a request-level error.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    /// Creates a status error with the backend's detail text.
    pub fn status(status: u16, detail: impl Into<String>) -> Self {
        Self::Status {
            status,
            detail: detail.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns `true` when the error is a caller-requested abort rather than a
    /// failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Top-level error type for the chat surface API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// Invalid transport or pacing configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid user input (for example an empty message).
    #[error("validation error: {0}")]
    Validation(String),
    /// Transport failed before streaming began.
    #[error(transparent)]
    Transport(TransportError),
    /// Internal invariant violation (for example a render task that panicked).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<TransportError> for ChatError {
    fn from(value: TransportError) -> Self {
        ChatError::Transport(value)
    }
}

pub(crate) fn transport_error_from_reqwest(err: &reqwest::Error, timeout_ms: u64) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout { timeout_ms }
    } else {
        TransportError::request(err.to_string())
    }
}
