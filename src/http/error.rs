//! Maps the core error taxonomy onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::errors::{CoreError, ErrorKind};

/// Wire error body: `{error, message, details, code, timestamp}`.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvariantViolation => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::ExternalStorage => StatusCode::BAD_GATEWAY,
        ErrorKind::ExternalLlm => StatusCode::BAD_GATEWAY,
        ErrorKind::ExternalEmbedding => StatusCode::BAD_GATEWAY,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(error = %self.0, code = kind.code(), "request failed");
        }
        let body = serde_json::json!({
            "error": kind,
            "message": self.0.to_string(),
            "details": self.0.details(),
            "code": kind.code(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_documented_status_codes() {
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorKind::ExternalLlm), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(ErrorKind::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
