//! API Key 认证
//!
//! `RequireApiKey` extractor：修改状态的端点（/check, /deploy）必须携带
//! `x-api-key: <key>` 或 `Authorization: Bearer <key>`

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{
        header::{HeaderMap, AUTHORIZATION},
        request::Parts,
    },
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// API Key 认证 Extractor
///
/// ```ignore
/// async fn trigger(_auth: RequireApiKey, State(state): State<Arc<AppState>>) { ... }
/// ```
#[derive(Debug, Clone)]
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        verify_api_key(&parts.headers, &state.api_key)
    }
}

/// 从请求头中取出调用方提供的 key
fn provided_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// 不因前缀匹配长度泄露信息的比较
fn keys_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// 验证 API Key
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<RequireApiKey, ApiError> {
    match provided_key(headers) {
        Some(key) if keys_match(key, expected_key) => Ok(RequireApiKey),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!("Missing API key");
            Err(ApiError::unauthorized())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_verify_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("test-key"));
        assert!(verify_api_key(&headers, "test-key").is_ok());
        assert!(verify_api_key(&headers, "test-key-2").is_err());
    }

    #[test]
    fn test_verify_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer test-key"));
        assert!(verify_api_key(&headers, "test-key").is_ok());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic test-key"));
        assert!(verify_api_key(&headers, "test-key").is_err());
    }

    #[test]
    fn test_verify_api_key_missing() {
        let headers = HeaderMap::new();
        assert!(verify_api_key(&headers, "test-key").is_err());
    }
}
