use std::any::Any;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tracing::error;

use crate::error::ApiError;
use crate::openai::ErrorEnvelope;

use super::SharedService;

const OPEN_PATHS: &[&str] = &["/", "/health"];

/// `Bearer <key>` or the bare key.
fn presented_key(value: &str) -> &str {
    value.strip_prefix("Bearer ").unwrap_or(value)
}

/// Inbound API-key check. Disabled when no key is configured.
pub(super) async fn require_api_key(
    State(svc): State<SharedService>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = svc.config.api_key.as_deref() else {
        return next.run(req).await;
    };
    if OPEN_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let Some(value) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    else {
        return ApiError::Unauthorized {
            message: "Missing Authorization header".to_string(),
        }
        .into_response();
    };
    if presented_key(value) != expected {
        return ApiError::Unauthorized {
            message: "Invalid API key".to_string(),
        }
        .into_response();
    }
    next.run(req).await
}

pub(super) fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Turns a handler panic into a 500 `server_error` envelope.
pub(super) fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("[PANIC] {}", detail);
    let mut resp = (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorEnvelope::new("Internal server error", "server_error", None)),
    )
        .into_response();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}
