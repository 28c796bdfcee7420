use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Main Error Type
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GenerationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // Convenience constructors
    pub fn offline() -> Self {
        Self::new(
            ErrorCode::Offline,
            "No network connection. Please check your internet connection.",
        )
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionError, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    pub fn already_active(target: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::AlreadyActive,
            format!("A generation is already running for {}", target.into()),
        )
    }

    pub fn insufficient_balance(required: u64, balance: u64) -> Self {
        Self::new(
            ErrorCode::InsufficientBalance,
            format!(
                "Insufficient word balance: {} words required, {} available",
                required, balance
            ),
        )
        .with_details(serde_json::json!({
            "required": required,
            "balance": balance,
            "shortage": required.saturating_sub(balance),
        }))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Operation cancelled")
    }

    pub fn bad_response(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadResponse, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for GenerationError {}

// ============================================================================
// Error Codes
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Connectivity
    Offline,
    ConnectionError,
    HeartbeatTimeout,
    StreamClosed,

    // Server declared
    ServerError,
    MaxRetriesExceeded,

    // Session usage
    InvalidState,
    AlreadyActive,
    Cancelled,

    // Orchestration
    InsufficientBalance,
    CollectionFailed,
    CollectionTimeout,
    SaveFailed,

    // Plumbing
    NotFound,
    BadResponse,
    ExternalServiceError,
    Internal,
}

impl ErrorCode {
    /// Transport-level failures that the reconnect policy may retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError | Self::HeartbeatTimeout | Self::StreamClosed
        )
    }

    /// Codes that describe a misuse of the API rather than a runtime failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidState | Self::AlreadyActive | Self::Cancelled | Self::InsufficientBalance
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidState | Self::AlreadyActive => 409,
            Self::Cancelled => 400,
            Self::InsufficientBalance => 402,
            Self::NotFound => 404,
            Self::Offline | Self::MaxRetriesExceeded => 503,
            Self::HeartbeatTimeout | Self::CollectionTimeout => 504,
            Self::ConnectionError
            | Self::StreamClosed
            | Self::BadResponse
            | Self::ExternalServiceError => 502,
            Self::ServerError | Self::CollectionFailed | Self::SaveFailed | Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::ServerError => "SERVER_ERROR",
            Self::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            Self::InvalidState => "INVALID_STATE",
            Self::AlreadyActive => "ALREADY_ACTIVE",
            Self::Cancelled => "CANCELLED",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::CollectionFailed => "COLLECTION_FAILED",
            Self::CollectionTimeout => "COLLECTION_TIMEOUT",
            Self::SaveFailed => "SAVE_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::BadResponse => "BAD_RESPONSE",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Maps a wire code back to a known code; server-specific codes yield `None`.
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "OFFLINE" => Self::Offline,
            "CONNECTION_ERROR" => Self::ConnectionError,
            "HEARTBEAT_TIMEOUT" => Self::HeartbeatTimeout,
            "STREAM_CLOSED" => Self::StreamClosed,
            "SERVER_ERROR" => Self::ServerError,
            "MAX_RETRIES_EXCEEDED" => Self::MaxRetriesExceeded,
            "INVALID_STATE" => Self::InvalidState,
            "ALREADY_ACTIVE" => Self::AlreadyActive,
            "CANCELLED" => Self::Cancelled,
            "INSUFFICIENT_BALANCE" => Self::InsufficientBalance,
            "COLLECTION_FAILED" => Self::CollectionFailed,
            "COLLECTION_TIMEOUT" => Self::CollectionTimeout,
            "SAVE_FAILED" => Self::SaveFailed,
            "NOT_FOUND" => Self::NotFound,
            "BAD_RESPONSE" => Self::BadResponse,
            "EXTERNAL_SERVICE_ERROR" => Self::ExternalServiceError,
            "INTERNAL_ERROR" => Self::Internal,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, GenerationError>;

// ============================================================================
// Error Record (session diagnostics log)
// ============================================================================

/// One entry of a session's append-only error log.
///
/// `code` is a string because server-declared errors carry their own codes
/// next to the ones defined in [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub recoverable: bool,
}

impl ErrorRecord {
    pub fn new(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: chrono::Utc::now(),
            recoverable,
        }
    }

    pub fn from_error(error: &GenerationError) -> Self {
        Self::new(error.code.as_str(), error.message.clone(), error.is_recoverable())
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ============================================================================
// Error Response (simulation server)
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: GenerationError,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: GenerationError) -> Self {
        Self {
            error,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl axum::response::IntoResponse for GenerationError {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::StatusCode;

        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (status, Json(ErrorResponse::new(self))).into_response()
    }
}

// ============================================================================
// Error Conversion Implementations
// ============================================================================

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::connection(format!("HTTP error: {}", err))
        } else if err.is_decode() {
            Self::bad_response(format!("Decode error: {}", err))
        } else {
            Self::new(
                ErrorCode::ExternalServiceError,
                format!("HTTP error: {}", err),
            )
        }
    }
}

impl From<serde_json::Error> for GenerationError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_response(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for GenerationError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("IO error: {}", err))
    }
}

// ============================================================================
// Error Context Extension
// ============================================================================

pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<GenerationError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let mut err = e.into();
            err.message = format!("{}: {}", context.into(), err.message);
            err
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn log_error(error: &GenerationError) {
    if error.is_recoverable() || error.code.is_client_error() {
        log::warn!("{}", error);
    } else {
        log::error!("{}", error);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = GenerationError::already_active("chapter 3");
        assert_eq!(err.code, ErrorCode::AlreadyActive);
        assert!(err.message.contains("chapter 3"));
    }

    #[test]
    fn test_insufficient_balance_details() {
        let err = GenerationError::insufficient_balance(1200, 500);
        let details = err.details.unwrap();
        assert_eq!(details["shortage"], 700);
        assert_eq!(details["required"], 1200);
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(ErrorCode::ConnectionError.is_recoverable());
        assert!(ErrorCode::HeartbeatTimeout.is_recoverable());
        assert!(!ErrorCode::Offline.is_recoverable());
        assert!(!ErrorCode::MaxRetriesExceeded.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = GenerationError::offline();
        let display = format!("{}", err);
        assert!(display.starts_with("[OFFLINE]"));
    }

    #[test]
    fn test_context_prefixes_message() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk gone"));
        let err = res.context("saving chapter").unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        assert!(err.message.starts_with("saving chapter: "));
    }

    #[test]
    fn test_record_from_error() {
        let record = ErrorRecord::from_error(&GenerationError::connection("reset by peer"));
        assert_eq!(record.code, "CONNECTION_ERROR");
        assert!(record.recoverable);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::InsufficientBalance.http_status(), 402);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::AlreadyActive.http_status(), 409);
    }

    #[test]
    fn test_code_parsing() {
        assert_eq!(ErrorCode::from_code("MAX_RETRIES_EXCEEDED"), Some(ErrorCode::MaxRetriesExceeded));
        assert_eq!(ErrorCode::from_code(ErrorCode::Internal.as_str()), Some(ErrorCode::Internal));
        assert_eq!(ErrorCode::from_code("MODEL_OVERLOADED"), None);
    }

    #[test]
    fn test_json_serialization() {
        let err = GenerationError::cancelled();
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Cancelled"));
    }
}
