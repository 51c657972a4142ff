use thiserror::Error;

/// Remote error codes worth another attempt.
const RETRYABLE_CODES: &[&str] = &[
    // timeouts
    "RequestTimeout",
    "RequestTimeoutException",
    "RequestTimeTooSkewed",
    "PriorRequestNotComplete",
    // connection
    "ConnectionError",
    "ConnectionReset",
    // throttling
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "SlowDown",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "LimitExceededException",
    "EC2ThrottledException",
    // server side
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "500",
    "502",
    "503",
    "504",
];

/// Whether a remote error code is transient.
pub fn is_retryable_code(code: &str) -> bool {
    RETRYABLE_CODES.contains(&code)
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Remote error {code}: {message}")]
    Remote {
        status: Option<u16>,
        code: String,
        message: String,
    },

    #[error("Network error {0}")]
    Network(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Retry limit exceeded")]
    RetryLimitExceeded,
}

impl TransferError {
    pub fn remote(status: Option<u16>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Remote error code, if this error came back from the store.
    pub fn code(&self) -> Option<&str> {
        match self {
            TransferError::Remote { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Decides whether the retry wrapper should try again.
    ///
    /// Local failures (missing file, bad request, bad json) never heal on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Remote { code, .. } => is_retryable_code(code),
            TransferError::Network(_) => true,
            TransferError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.is_request()
                    || err.status().is_some_and(|status| status.is_server_error())
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
