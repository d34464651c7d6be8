pub mod admin;
pub mod conversation;
pub mod generate;
pub mod media;
pub mod metrics;
pub mod payments;
pub mod users;

pub use admin::{ban_handler, grant_handler, lookup_handler, stats_handler, unban_handler};
pub use conversation::{cancel_handler, confirm_handler, start_handler, toggle_handler};
pub use generate::generate_handler;
pub use media::{fetch_media_handler, upload_media_handler};
pub use metrics::metrics_handler;
pub use payments::{create_payment_handler, packages_handler};
pub use users::{balance_handler, register_handler};

use actix_web::{http::StatusCode, web, HttpResponse, ResponseError};
use cardsmith_domain::model::{UserId, UserRecord};
use cardsmith_domain::services::ConversationError;
use cardsmith_domain::storage::{StorageError, UserStore};
use cardsmith_reconciler::ReconcileError;
use serde::Serialize;
use thiserror::Error;

use crate::state::AppState;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("user not found")]
    UnknownUser,
    #[error("not found")]
    NotFound,
    #[error("user is banned")]
    Banned,
    #[error("operator access required")]
    NotOperator,
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("payment provider unavailable: {0}")]
    Payment(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ReconcileError> for ApiError {
    fn from(value: ReconcileError) -> Self {
        match value {
            ReconcileError::Storage(err) => Self::Storage(err),
            ReconcileError::Provider(err) => Self::Payment(err.to_string()),
            ReconcileError::Entropy(message) => Self::Internal(message),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownUser | ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Banned => StatusCode::FORBIDDEN,
            ApiError::NotOperator => StatusCode::UNAUTHORIZED,
            ApiError::Conversation(ConversationError::Busy) => StatusCode::CONFLICT,
            ApiError::Conversation(_) => StatusCode::BAD_REQUEST,
            ApiError::Payment(_) => StatusCode::BAD_GATEWAY,
            ApiError::Storage(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Loads a known, non-banned user. Every user-initiated route goes through
/// here before touching the orchestrator or the payment provider.
pub(crate) async fn active_user(state: &AppState, user_id: UserId) -> Result<UserRecord, ApiError> {
    let user = state
        .storage()
        .find_user(user_id)
        .await?
        .ok_or(ApiError::UnknownUser)?;
    if user.is_banned {
        return Err(ApiError::Banned);
    }
    Ok(user)
}

/// Mounts the end-user routes.
pub fn public_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/users", web::post().to(register_handler))
        .route("/api/v1/users/{id}/balance", web::get().to(balance_handler))
        .route("/api/v1/media", web::post().to(upload_media_handler))
        .route("/media/{key}", web::get().to(fetch_media_handler))
        .route("/api/v1/generate", web::post().to(generate_handler))
        .route(
            "/api/v1/conversations/{id}/start",
            web::post().to(start_handler),
        )
        .route(
            "/api/v1/conversations/{id}/toggle",
            web::post().to(toggle_handler),
        )
        .route(
            "/api/v1/conversations/{id}/confirm",
            web::post().to(confirm_handler),
        )
        .route(
            "/api/v1/conversations/{id}",
            web::delete().to(cancel_handler),
        )
        .route("/api/v1/payments/packages", web::get().to(packages_handler))
        .route("/api/v1/payments", web::post().to(create_payment_handler));
}

/// Mounts the operator routes; each handler checks `X-Operator-Id`.
pub fn admin_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/admin/users/{lookup}", web::get().to(lookup_handler))
        .route(
            "/api/v1/admin/users/{lookup}/grant",
            web::post().to(grant_handler),
        )
        .route(
            "/api/v1/admin/users/{lookup}/ban",
            web::post().to(ban_handler),
        )
        .route(
            "/api/v1/admin/users/{lookup}/unban",
            web::post().to(unban_handler),
        )
        .route("/api/v1/admin/stats", web::get().to(stats_handler));
}
