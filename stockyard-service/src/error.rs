//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the service error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the broker
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// A `$ref` in the configuration did not resolve through the environment
    #[error("Unresolved configuration reference: {0}")]
    UnresolvedRef(String),

    /// Malformed request body, template, or resource handle
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request names a vendor the registry does not know
    #[error("Unknown vendor: {0}")]
    UnknownVendor(String),

    /// Request names an endpoint the vendor does not export
    #[error("Unknown endpoint: {0}.{1}")]
    UnknownEndpoint(String, String),

    /// Correlation id not present in the response store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Wire codec failure (dates, durations, handles, corr ids)
    #[error("Codec error: {0}")]
    Codec(String),

    /// Upstream transport failure (vendor HTTP session or broker socket)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The upstream payload did not match the endpoint's declared shape
    #[error("Schema drift: {0}")]
    SchemaDrift(String),

    /// Broker connection state machine failure
    #[error("Broker connection: {0}")]
    Broker(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Template file failed validation or parsing
    #[error("Template error: {0}")]
    Template(String),

    /// Coverage planner could not satisfy a template
    #[error("Plan error: {0}")]
    Plan(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(Box::new(e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Upstream(e.to_string())
    }
}

impl Error {
    /// Whether a retry at the decorator layer could plausibly succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Upstream(_) | Error::Broker(_))
    }
}

/// Error response body for client errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Machine-readable error code
    pub code: String,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create an error response with a code
    pub fn new(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::BadRequest(_)
            | Error::UnknownVendor(_)
            | Error::UnknownEndpoint(_, _)
            | Error::Codec(_)
            | Error::Template(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match status {
            // Client errors carry a structured JSON body
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                let code = match &self {
                    Error::UnknownVendor(_) => "UNKNOWN_VENDOR",
                    Error::UnknownEndpoint(_, _) => "UNKNOWN_ENDPOINT",
                    Error::NotFound(_) => "NOT_FOUND",
                    Error::Codec(_) => "CODEC_ERROR",
                    Error::Template(_) => "TEMPLATE_ERROR",
                    _ => "BAD_REQUEST",
                };
                (
                    status,
                    Json(ErrorResponse::new(status, code, self.to_string())),
                )
                    .into_response()
            }
            // Everything else surfaces as 500 with a plain-text reason
            _ => {
                tracing::error!("request failed: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_400() {
        let err = Error::UnknownVendor("acme".into());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_corr_id_maps_to_404() {
        let err = Error::NotFound("corr_id 42".into());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn upstream_errors_are_retriable() {
        assert!(Error::Upstream("connection reset".into()).is_retriable());
        assert!(!Error::BadRequest("nope".into()).is_retriable());
    }
}
