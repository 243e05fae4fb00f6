//! Error handling for the report server
//!
//! Maps library errors onto HTTP statuses and renders every failure as a JSON
//! body of the form `{ "error": code, "message": text, "details": ... }`.

use atrius_registry_report::ReportError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::fmt;

/// Server-specific error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum ServerError {
    /// Invalid request parameters or body
    BadRequest(String),

    /// Unsupported media type or format
    UnsupportedMediaType(String),

    /// Error raised while compiling or running an export
    Report(ReportError),

    /// JSON parsing error
    JsonError(serde_json::Error),

    /// Generic internal server error
    InternalError(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ServerError::UnsupportedMediaType(msg) => write!(f, "Unsupported media type: {}", msg),
            ServerError::Report(err) => write!(f, "Report error: {}", err),
            ServerError::JsonError(err) => write!(f, "JSON error: {}", err),
            ServerError::InternalError(msg) => write!(f, "Internal server error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<ReportError> for ServerError {
    fn from(err: ReportError) -> Self {
        match &err {
            ReportError::UnsupportedContentType(_) => {
                ServerError::UnsupportedMediaType(err.to_string())
            }
            ReportError::InvalidOptions(_) => ServerError::BadRequest(err.to_string()),
            _ => ServerError::Report(err),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::JsonError(err)
    }
}

impl ServerError {
    fn parts(&self) -> (StatusCode, &'static str, Value) {
        match self {
            ServerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid", json!(msg)),
            ServerError::UnsupportedMediaType(msg) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "not-supported",
                json!(msg),
            ),
            ServerError::JsonError(err) => (
                StatusCode::BAD_REQUEST,
                "invalid",
                json!(format!("Invalid JSON: {}", err)),
            ),
            ServerError::InternalError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "exception", json!(msg))
            }
            ServerError::Report(err) => match err {
                ReportError::Configuration(problems) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "configuration",
                    json!(problems),
                ),
                ReportError::HeaderCollision(collisions) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "label-collision",
                    serde_json::to_value(collisions).unwrap_or_else(|_| json!(err.to_string())),
                ),
                ReportError::Fetch(msg) => (StatusCode::BAD_GATEWAY, "fetch", json!(msg)),
                ReportError::Encoding(msg) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "encoding", json!(msg))
                }
                ReportError::UnsupportedContentType(_) => (
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "not-supported",
                    json!(err.to_string()),
                ),
                ReportError::InvalidOptions(_) | ReportError::Serialization(_) => {
                    (StatusCode::BAD_REQUEST, "invalid", json!(err.to_string()))
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "exception",
                    json!(err.to_string()),
                ),
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = self.parts();
        let body = json!({
            "error": error_code,
            "message": self.to_string(),
            "details": details,
        });
        (status, Json(body)).into_response()
    }
}

/// Result type alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ServerError::from(ReportError::configuration("unknown form 'X'")),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ServerError::from(ReportError::Fetch("down".to_string())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ServerError::from(ReportError::UnsupportedContentType("xml".to_string())),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (
                ServerError::from(ReportError::Encoding("patient 1".to_string())),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ServerError::from(ReportError::InvalidOptions("page size".to_string())),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_configuration_details_list_every_problem() {
        let error = ServerError::from(ReportError::Configuration(vec![
            "a".to_string(),
            "b".to_string(),
        ]));
        let (_, code, details) = error.parts();
        assert_eq!(code, "configuration");
        assert_eq!(details, json!(["a", "b"]));
    }
}
