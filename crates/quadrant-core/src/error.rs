//! Error types for the quadrant transport.
//!
//! A single enum covers local validation failures, registry misconfiguration,
//! failures reported by the remote side and transport loss, so callers can
//! match on the cause without string inspection.

use crate::schema::MethodKind;
use crate::validate::ValidationFailure;
use axum::http::StatusCode;
use thiserror::Error;

/// Main error type for the transport.
#[derive(Debug, Error)]
pub enum RpcError {
    // Validation errors
    #[error("Invalid input for {procedure}: {failure}")]
    InvalidInput {
        procedure: String,
        failure: ValidationFailure,
    },

    #[error("Invalid output from {procedure}: {failure}")]
    InvalidOutput {
        procedure: String,
        failure: ValidationFailure,
    },

    // Registry errors
    #[error("Unknown procedure: {service}.{procedure}")]
    UnknownProcedure { service: String, procedure: String },

    #[error("Duplicate procedure {procedure} in service {service}")]
    DuplicateProcedure { service: String, procedure: String },

    #[error("Duplicate service: {service}")]
    DuplicateService { service: String },

    #[error("{service}.{procedure} is a {kind} procedure: {detail}")]
    KindMismatch {
        service: String,
        procedure: String,
        kind: MethodKind,
        detail: String,
    },

    #[error("No implementation registered for {service}.{procedure}")]
    MissingImplementation { service: String, procedure: String },

    // Remote errors
    /// The server reported a non-success outcome. `message` is its text, verbatim.
    #[error("{message}")]
    Remote {
        status: Option<u16>,
        message: String,
    },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    // Connection errors
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {message}")]
    Transport { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Failure raised by a procedure implementation.
    #[error("{0}")]
    Procedure(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RpcError::Transport {
                message: "request timed out".to_string(),
            }
        } else {
            RpcError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RpcError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => RpcError::ConnectionClosed,
            WsError::Http(response) => {
                let message = response
                    .body()
                    .as_ref()
                    .map(|body| String::from_utf8_lossy(body).into_owned())
                    .unwrap_or_else(|| "No error message returned from backend".to_string());
                RpcError::Remote {
                    status: Some(response.status().as_u16()),
                    message,
                }
            }
            other => RpcError::Transport {
                message: other.to_string(),
            },
        }
    }
}

impl RpcError {
    /// Shorthand for an implementation-level failure.
    pub fn procedure(message: impl Into<String>) -> Self {
        RpcError::Procedure(message.into())
    }

    /// HTTP status the dispatcher answers with for this error.
    ///
    /// - 400: the request payload failed validation
    /// - 404: no such service or procedure
    /// - 405: the request does not match the procedure's method kind
    /// - 500: everything else, including implementation failures
    pub fn status_code(&self) -> StatusCode {
        match self {
            RpcError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            RpcError::UnknownProcedure { .. } => StatusCode::NOT_FOUND,
            RpcError::KindMismatch { .. } => StatusCode::METHOD_NOT_ALLOWED,
            RpcError::Remote {
                status: Some(status),
                ..
            } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),

            // All other errors are internal errors
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error means the underlying transport is gone, as opposed
    /// to an application-level failure on a healthy connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Transport { .. } | RpcError::ConnectionClosed | RpcError::Io { .. }
        )
    }
}
