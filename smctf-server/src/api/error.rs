//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use smctf_core::StackError;
use tracing::error;

/// Wrapper turning [`StackError`] into the API's JSON error responses.
#[derive(Debug)]
pub struct ApiError(pub StackError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<StackError> for ApiError {
    fn from(err: StackError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;

        let (status, message) = match &err {
            StackError::NotFound => (StatusCode::NOT_FOUND, err.to_string()),
            StackError::InvalidInput { .. } | StackError::PodSpecInvalid { .. } => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            StackError::NoAvailableNodePort | StackError::ClusterSaturated { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            _ => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: StackError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(StackError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(StackError::invalid_input("x")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(StackError::pod_spec_invalid("x")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(StackError::NoAvailableNodePort),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(StackError::saturated("x")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(StackError::Internal("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(StackError::Repository("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
