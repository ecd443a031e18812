//! Maps core error kinds onto HTTP responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use nimbus_common::CoreError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::BackendUnavailable(_) | CoreError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::BackendRejected(_) => StatusCode::BAD_GATEWAY,
            CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.0.kind();
        match self.0 {
            CoreError::Validation { field, message } => {
                (status, Json(json!({ "error": kind, "field": field, "message": message }))).into_response()
            }
            CoreError::RateLimited => status.into_response(),
            CoreError::CircuitOpen { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                let mut res = (status, Json(json!({ "error": kind, "message": "backend circuit open" }))).into_response();
                if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                    res.headers_mut().insert(header::RETRY_AFTER, v);
                }
                res
            }
            CoreError::Internal(message) => {
                tracing::error!(error = %message, "internal error");
                (status, Json(json!({ "error": kind, "message": "internal server error" }))).into_response()
            }
            other => (status, Json(json!({ "error": kind, "message": other.to_string() }))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn statuses() {
        let cases = [
            (CoreError::validation("name", "bad"), 400),
            (CoreError::not_found("vpc x"), 404),
            (CoreError::Conflict("dup".into()), 409),
            (CoreError::BackendUnavailable("down".into()), 503),
            (CoreError::BackendRejected("no".into()), 502),
            (CoreError::CircuitOpen { retry_after: Duration::from_secs(3) }, 503),
            (CoreError::RateLimited, 429),
            (CoreError::Internal("db exploded".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError(err).into_response().status().as_u16(), code);
        }
    }

    #[test]
    fn circuit_open_carries_retry_after() {
        let res = ApiError(CoreError::CircuitOpen {
            retry_after: Duration::from_millis(1500),
        })
        .into_response();
        assert_eq!(res.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }
}
