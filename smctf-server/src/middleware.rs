//! API-key authentication middleware.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use smctf_core::ApiKeyConfig;

const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_QUERY: &str = "api_key";

/// Require the shared API key on every route except the health probe.
/// The key is accepted from the `X-API-KEY` header or the `api_key` query
/// parameter.
pub async fn api_key_guard(
    State(cfg): State<ApiKeyConfig>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == "/healthz" {
        return next.run(request).await;
    }

    if !cfg.enabled {
        return next.run(request).await;
    }

    let expected = cfg.value.trim();
    if expected.is_empty() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "api key is not configured" })),
        )
            .into_response();
    }

    let provided = header_key(&request).or_else(|| query_key(&request));
    match provided {
        Some(key) if key == expected => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid api key" })),
        )
            .into_response(),
    }
}

fn header_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn query_key(request: &Request) -> Option<String> {
    let query = request.uri().query()?;

    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(API_KEY_QUERY) {
            let value = parts.next().unwrap_or("").trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    None
}
