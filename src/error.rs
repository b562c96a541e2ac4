use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::egress::DispatchError;
use crate::openai::ErrorEnvelope;
use crate::session::SessionError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Every failure the HTTP surface can report, rendered as an OpenAI error envelope.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Unauthorized { message: String },
    /// Upstream answered with a non-success status and a non-JSON body.
    #[error("{message}")]
    Upstream { status: StatusCode, message: String },
    /// Upstream answered with a JSON error body; forwarded byte-for-byte.
    #[error("upstream returned {status}")]
    UpstreamBody { status: StatusCode, body: Bytes },
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    NotImplemented(String),
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ApiError::InvalidRequest(message.into())
    }

    pub fn missing(param: &str) -> Self {
        ApiError::InvalidRequest(format!("Missing required parameter: {param}"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Upstream { status, .. } | ApiError::UpstreamBody { status, .. } => *status,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) | ApiError::NotFound(_) | ApiError::Unauthorized { .. } => {
                "invalid_request_error"
            }
            ApiError::Upstream { .. } | ApiError::UpstreamBody { .. } => "upstream_error",
            ApiError::BadGateway(_) | ApiError::Internal(_) => "server_error",
            ApiError::NotImplemented(_) => "not_implemented",
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ApiError::Unauthorized { .. } => Some("invalid_api_key"),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::UpstreamBody { body, .. } => {
                let mut resp = (status, body).into_response();
                resp.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                resp
            }
            other => {
                let envelope = ErrorEnvelope::new(other.to_string(), other.kind(), other.code());
                (status, Json(envelope)).into_response()
            }
        }
    }
}

/// Status to report for a failed upstream exchange. Anything that is not a
/// 4xx or 5xx (a 202, a 3xx) becomes 502.
pub fn coerce_upstream_status(status: StatusCode) -> StatusCode {
    if status.is_client_error() || status.is_server_error() {
        status
    } else {
        StatusCode::BAD_GATEWAY
    }
}

impl From<DispatchError> for ApiError {
    fn from(_: DispatchError) -> Self {
        ApiError::BadGateway("Upstream request failed".to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Create(_) => {
                ApiError::BadGateway("Failed to create chat session".to_string())
            }
            SessionError::SendTransport(_) => {
                ApiError::BadGateway("Failed to send message".to_string())
            }
            SessionError::SendRejected { status, body } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                ApiError::Upstream {
                    status: coerce_upstream_status(status),
                    message: format!("Chat session error: {}", String::from_utf8_lossy(&body)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn unauthorized_carries_code() {
        let resp = ApiError::Unauthorized {
            message: "Invalid API key".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["type"], "invalid_request_error");
        assert_eq!(v["error"]["code"], "invalid_api_key");
        assert_eq!(v["error"]["message"], "Invalid API key");
    }

    #[tokio::test]
    async fn upstream_json_body_is_forwarded_verbatim() {
        let raw = br#"{"error":{"message":"quota"}}"#;
        let resp = ApiError::UpstreamBody {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: Bytes::from_static(raw),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], raw);
    }

    #[tokio::test]
    async fn session_rejection_keeps_upstream_status() {
        let err: ApiError = SessionError::SendRejected {
            status: 403,
            body: Bytes::from_static(b"denied"),
        }
        .into();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        let v = body_json(err.into_response()).await;
        assert_eq!(v["error"]["type"], "upstream_error");
        assert_eq!(v["error"]["message"], "Chat session error: denied");
        assert!(v["error"].get("code").is_none());
    }

    #[test]
    fn session_rejection_with_success_status_becomes_bad_gateway() {
        for status in [201, 202, 204, 302] {
            let err: ApiError = SessionError::SendRejected {
                status,
                body: Bytes::from_static(b"queued"),
            }
            .into();
            assert_eq!(err.status(), StatusCode::BAD_GATEWAY, "status {status}");
        }
    }

    #[test]
    fn upstream_status_coercion_keeps_errors() {
        assert_eq!(coerce_upstream_status(StatusCode::TOO_MANY_REQUESTS), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(coerce_upstream_status(StatusCode::SERVICE_UNAVAILABLE), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(coerce_upstream_status(StatusCode::NO_CONTENT), StatusCode::BAD_GATEWAY);
    }
}
