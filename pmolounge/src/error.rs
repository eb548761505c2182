//! Error types for the lounge session client

/// Result type alias for lounge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pairing or running a lounge session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure (connection refused, timeout, body read error)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error (certificate files, configuration directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error (from the YAML loader)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Launch data carried no pairing code
    #[error("Launch data has no pairing code")]
    MissingPairingCode,

    /// The screen id endpoint answered with an empty body
    #[error("Screen id endpoint returned an empty body")]
    EmptyScreenId,

    /// The token endpoint answered without a lounge token
    #[error("Lounge token not found in response")]
    TokenMissing,

    /// The pairing code was refused by the server
    #[error("Pairing code registration rejected: HTTP {status}")]
    RegistrationRejected { status: u16 },

    /// A non-recoverable HTTP status was received
    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// A channel failed more times in a row than the configured budget allows
    #[error("{channel} channel exceeded its retry budget after {errors} consecutive errors")]
    RetryBudgetExceeded { channel: &'static str, errors: u32 },

    /// Operation attempted on a session that is not running
    #[error("Session is not running")]
    NotRunning,

    /// `start` was called on a session that already left `Unbound`
    #[error("Session already started")]
    AlreadyStarted,
}

impl Error {
    /// Create an unexpected status error, truncating long bodies
    pub fn unexpected_status(status: u16, body: impl AsRef<str>) -> Self {
        let body = body.as_ref();
        let body = match body.char_indices().nth(200) {
            Some((cut, _)) => format!("{}...", &body[..cut]),
            None => body.to_string(),
        };
        Self::UnexpectedStatus { status, body }
    }

    /// True for errors a caller may retry: transport failures and 5xx replies
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
