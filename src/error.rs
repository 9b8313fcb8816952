use thiserror::Error;

/// Unified error type for the autobid transport and its API clients
#[derive(Error, Debug)]
pub enum AutobidError {
    // Connection establishment errors
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Request errors
    #[error("Request failed: {0}")]
    Request(String),

    #[error("max retries exceeded")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("{status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Rate limiting
    #[error("too many requests: status {status_code}, retry after {retry_after_seconds} secs")]
    FloodWait {
        status_code: u16,
        retry_after_seconds: f64,
        origin: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Decoding errors
    #[error("Error parsing JSON: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for autobid operations
pub type Result<T> = std::result::Result<T, AutobidError>;

impl AutobidError {
    /// No connection could be established (dial, tunnel or handshake)
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            AutobidError::Connect(_)
                | AutobidError::InvalidProxyAddress(_)
                | AutobidError::UnsupportedProtocol(_)
        )
    }

    /// The request was sent (or attempted) but did not produce a usable response
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            AutobidError::Request(_)
                | AutobidError::MaxRetriesExceeded { .. }
                | AutobidError::Status { .. }
                | AutobidError::Timeout { .. }
                | AutobidError::InvalidRequest(_)
                | AutobidError::Io(_)
        )
    }

    pub fn is_flood_wait(&self) -> bool {
        matches!(self, AutobidError::FloodWait { .. })
    }

    /// Backoff (seconds) reported by a flood-wait failure
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            AutobidError::FloodWait {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AutobidError::Status { status, .. } => Some(*status),
            AutobidError::FloodWait { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for AutobidError {
    fn from(err: url::ParseError) -> Self {
        AutobidError::InvalidRequest(err.to_string())
    }
}

// Convert from header construction errors
impl From<http::header::InvalidHeaderName> for AutobidError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        AutobidError::InvalidRequest(format!("invalid header name: {}", err))
    }
}

impl From<http::header::InvalidHeaderValue> for AutobidError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        AutobidError::InvalidRequest(format!("invalid header value: {}", err))
    }
}

impl From<http::method::InvalidMethod> for AutobidError {
    fn from(err: http::method::InvalidMethod) -> Self {
        AutobidError::InvalidRequest(format!("invalid method: {}", err))
    }
}
