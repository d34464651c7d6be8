use actix_web::{web, HttpResponse};
use cardsmith_domain::model::{Credits, UserId, UserProfile, UserRecord};
use cardsmith_domain::storage::UserStore;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::ApiError;

#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterRequest {
    pub platform_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserView {
    pub platform_id: i64,
    pub username: Option<String>,
    pub balance: Credits,
    pub is_admin: bool,
    pub is_banned: bool,
}

impl From<UserRecord> for UserView {
    fn from(record: UserRecord) -> Self {
        Self {
            platform_id: record.platform_id.get(),
            username: record.username,
            balance: record.balance,
            is_admin: record.is_admin,
            is_banned: record.is_banned,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub balance: Credits,
}

/// First contact or identity refresh; called for every chat event.
pub async fn register_handler(
    state: web::Data<AppState>,
    payload: web::Json<RegisterRequest>,
) -> Result<HttpResponse, ApiError> {
    let payload = payload.into_inner();
    let platform_id = UserId::new(payload.platform_id);
    let record = state
        .storage()
        .get_or_create_user(UserProfile {
            platform_id,
            username: payload.username.filter(|name| !name.trim().is_empty()),
            full_name: payload.full_name.filter(|name| !name.trim().is_empty()),
            is_admin: state.is_admin(platform_id),
        })
        .await?;
    counter!("gateway_requests_total", "route" => "register", "status" => "ok").increment(1);
    Ok(HttpResponse::Ok().json(UserView::from(record)))
}

pub async fn balance_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let record = state
        .storage()
        .find_user(UserId::new(path.into_inner()))
        .await?
        .ok_or(ApiError::UnknownUser)?;
    Ok(HttpResponse::Ok().json(BalanceResponse {
        balance: record.balance,
    }))
}
