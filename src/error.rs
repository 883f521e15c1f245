use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Main error type for the kvflood store
#[derive(Debug)]
pub enum KvError {
    /// Malformed filter, key, or area id supplied by a caller
    Validation(String),

    /// Configuration or CLI argument errors, rejected at startup
    Config(String),

    /// A peer could not be reached; the peer is marked for resync
    PeerUnreachable(String),

    /// Full sync with a peer exceeded its deadline
    SyncTimeout(String),

    /// A subscriber fell behind and its stream was closed
    SubscriberBackpressure(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Transport layer errors
    Transport(String),

    /// Serialization/deserialization errors
    Serialization(SerializationError),

    /// An area actor went away or dropped a response channel
    Concurrency(String),
}

/// Serialization related errors
#[derive(Debug)]
pub enum SerializationError {
    /// JSON serialization/deserialization errors
    Json(serde_json::Error),

    /// Binary encoding errors on the peer wire protocol
    Encode(bincode::error::EncodeError),

    /// Binary decoding errors on the peer wire protocol
    Decode(bincode::error::DecodeError),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Validation(msg) => write!(f, "Validation error: {}", msg),
            KvError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KvError::PeerUnreachable(msg) => write!(f, "Peer unreachable: {}", msg),
            KvError::SyncTimeout(msg) => write!(f, "Sync timeout: {}", msg),
            KvError::SubscriberBackpressure(msg) => {
                write!(f, "Subscriber backpressure: {}", msg)
            }
            KvError::Io(err) => write!(f, "I/O error: {}", err),
            KvError::Transport(msg) => write!(f, "Transport error: {}", msg),
            KvError::Serialization(err) => write!(f, "Serialization error: {}", err),
            KvError::Concurrency(msg) => write!(f, "Concurrency error: {}", msg),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Json(err) => write!(f, "JSON: {}", err),
            SerializationError::Encode(err) => write!(f, "Binary encode: {}", err),
            SerializationError::Decode(err) => write!(f, "Binary decode: {}", err),
        }
    }
}

impl std::error::Error for KvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KvError::Io(err) => Some(err),
            KvError::Serialization(err) => err.source(),
            _ => None,
        }
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Json(err) => Some(err),
            SerializationError::Encode(err) => Some(err),
            SerializationError::Decode(err) => Some(err),
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, KvError>;

// Axum IntoResponse implementation for HTTP error responses
impl IntoResponse for KvError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

impl KvError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            KvError::Validation(_) => StatusCode::BAD_REQUEST,
            KvError::Config(_) => StatusCode::BAD_REQUEST,
            KvError::PeerUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            KvError::SyncTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            KvError::SubscriberBackpressure(_) => StatusCode::SERVICE_UNAVAILABLE,
            KvError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            KvError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            KvError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            KvError::Concurrency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            KvError::Validation(_) => "validation_error",
            KvError::Config(_) => "configuration_error",
            KvError::PeerUnreachable(_) => "peer_unreachable",
            KvError::SyncTimeout(_) => "sync_timeout",
            KvError::SubscriberBackpressure(_) => "subscriber_backpressure",
            KvError::Io(_) => "io_error",
            KvError::Transport(_) => "transport_error",
            KvError::Serialization(_) => "serialization_error",
            KvError::Concurrency(_) => "concurrency_error",
        }
    }
}

// Conversions from common error types
impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io(err)
    }
}

impl From<serde_json::Error> for KvError {
    fn from(err: serde_json::Error) -> Self {
        KvError::Serialization(SerializationError::Json(err))
    }
}

impl From<bincode::error::EncodeError> for KvError {
    fn from(err: bincode::error::EncodeError) -> Self {
        KvError::Serialization(SerializationError::Encode(err))
    }
}

impl From<bincode::error::DecodeError> for KvError {
    fn from(err: bincode::error::DecodeError) -> Self {
        KvError::Serialization(SerializationError::Decode(err))
    }
}

impl From<SerializationError> for KvError {
    fn from(err: SerializationError) -> Self {
        KvError::Serialization(err)
    }
}

impl From<regex::Error> for KvError {
    fn from(err: regex::Error) -> Self {
        KvError::Validation(format!("Invalid key pattern: {}", err))
    }
}

impl From<reqwest::Error> for KvError {
    fn from(err: reqwest::Error) -> Self {
        KvError::Transport(err.to_string())
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::error::KvError::Validation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KvError::Validation(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::KvError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KvError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::KvError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KvError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! concurrency_error {
    ($msg:expr) => {
        $crate::error::KvError::Concurrency($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::KvError::Concurrency(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KvError::Validation("empty key prefix".to_string());
        assert_eq!(err.to_string(), "Validation error: empty key prefix");

        let io_err = KvError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        ));
        assert!(io_err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let kv_err: KvError = io_err.into();
        assert!(matches!(kv_err, KvError::Io(_)));

        let regex_err = regex::Regex::new("(").unwrap_err();
        let kv_err: KvError = regex_err.into();
        assert!(matches!(kv_err, KvError::Validation(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            validation_error!("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            KvError::SyncTimeout("peer".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            KvError::PeerUnreachable("peer".into()).error_type(),
            "peer_unreachable"
        );
    }

    #[test]
    fn test_macros() {
        let err = config_error!("Area {} is duplicated", "spine");
        assert_eq!(err.to_string(), "Configuration error: Area spine is duplicated");

        let err = transport_error!("connection reset");
        assert_eq!(err.to_string(), "Transport error: connection reset");
    }
}
