use thiserror::Error;

/// Result type used throughout the loader.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Errors that can occur while retrieving, processing or caching DICOM images.
///
/// The enum is `Clone` because a single fetch may be awaited by several
/// coalesced callers, each of which receives its own copy of the outcome.
#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    /// Invalid options, fatal at construction or reconfiguration and never retried
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network-level failure (connection refused, reset, DNS, body read)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request timed out; treated like any other transport failure
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Non-2xx HTTP response
    #[error("Protocol error: HTTP {status} - {message}")]
    Protocol { status: u16, message: String },

    /// Operation aborted by its caller
    #[error("Operation cancelled")]
    Cancelled,

    /// External pixel decoder failure
    #[error("Decode error: {0}")]
    Decode(String),

    /// Identifier does not follow any supported locator grammar
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// DICOM-JSON document could not be interpreted
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Progressive session id is unknown or already completed
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// A background task panicked or was torn down
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LoaderError {
    /// Check whether the error describes a cancelled operation.
    ///
    /// Besides the explicit variant, any error whose message mentions
    /// cancellation or an abort is treated as one.
    pub fn is_cancellation(&self) -> bool {
        match self {
            LoaderError::Cancelled => true,
            LoaderError::Transport(message) | LoaderError::Timeout(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("cancel") || message.contains("abort")
            }
            _ => false,
        }
    }

    /// Check whether the error is a transport failure that qualifies for retry.
    pub fn is_transient_transport(&self) -> bool {
        matches!(self, LoaderError::Transport(_) | LoaderError::Timeout(_)) && !self.is_cancellation()
    }

    /// HTTP status carried by a protocol error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            LoaderError::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LoaderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LoaderError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            LoaderError::Protocol {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_builder() {
            LoaderError::Configuration(e.to_string())
        } else {
            LoaderError::Transport(e.to_string())
        }
    }
}

impl From<url::ParseError> for LoaderError {
    fn from(e: url::ParseError) -> Self {
        LoaderError::Configuration(format!("invalid URL: {}", e))
    }
}
