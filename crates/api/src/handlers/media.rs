use actix_web::{http::header, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::ApiError;

/// Uploads larger than this are refused before they reach the cache.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub key: String,
    pub url: String,
}

pub async fn upload_media_handler(
    state: web::Data<AppState>,
    request: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    if body.is_empty() {
        return Err(ApiError::Validation("empty upload".into()));
    }
    if body.len() > MAX_UPLOAD_BYTES {
        return Err(ApiError::Validation(format!(
            "upload exceeds {MAX_UPLOAD_BYTES} bytes"
        )));
    }
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream");
    if !(content_type.starts_with("image/") || content_type.starts_with("video/")) {
        return Err(ApiError::Validation(format!(
            "unsupported media type {content_type}"
        )));
    }
    let key = state
        .media()
        .put(body, content_type)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let url = state.media().url_for(&key).as_str().to_string();
    Ok(HttpResponse::Created().json(UploadResponse { key, url }))
}

pub async fn fetch_media_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let stored = state
        .media()
        .get(&path.into_inner())
        .ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok()
        .content_type(stored.content_type)
        .body(stored.bytes))
}
