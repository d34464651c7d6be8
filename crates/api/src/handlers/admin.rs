use actix_web::{web, HttpRequest, HttpResponse};
use cardsmith_domain::model::{Credits, UserId, UserLookup, UserRecord};
use cardsmith_domain::services::Notification;
use cardsmith_domain::storage::{BalanceStore, UserStore};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state::AppState;

use super::users::UserView;
use super::ApiError;

pub const OPERATOR_HEADER: &str = "X-Operator-Id";

#[derive(Debug, Deserialize, Serialize)]
pub struct GrantRequest {
    pub credits: Credits,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantResponse {
    pub platform_id: i64,
    pub balance: Credits,
}

fn require_operator(state: &AppState, request: &HttpRequest) -> Result<UserId, ApiError> {
    let operator = request
        .headers()
        .get(OPERATOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .map(UserId::new)
        .ok_or(ApiError::NotOperator)?;
    if !state.is_admin(operator) {
        counter!("gateway_requests_total", "route" => "admin", "status" => "denied").increment(1);
        return Err(ApiError::NotOperator);
    }
    Ok(operator)
}

async fn resolve(state: &AppState, raw: &str) -> Result<UserRecord, ApiError> {
    let lookup = UserLookup::parse(raw)
        .ok_or_else(|| ApiError::Validation("expected a numeric id or @username".into()))?;
    let found = match lookup {
        UserLookup::PlatformId(id) => state.storage().find_user(id).await?,
        UserLookup::Username(name) => state.storage().find_user_by_username(&name).await?,
    };
    found.ok_or(ApiError::UnknownUser)
}

pub async fn lookup_handler(
    state: web::Data<AppState>,
    request: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_operator(&state, &request)?;
    let user = resolve(&state, &path).await?;
    Ok(HttpResponse::Ok().json(UserView::from(user)))
}

pub async fn grant_handler(
    state: web::Data<AppState>,
    request: HttpRequest,
    path: web::Path<String>,
    payload: web::Json<GrantRequest>,
) -> Result<HttpResponse, ApiError> {
    let operator = require_operator(&state, &request)?;
    if payload.credits <= 0 {
        return Err(ApiError::Validation("credits must be positive".into()));
    }
    let user = resolve(&state, &path).await?;
    let balance = state
        .storage()
        .credit(user.platform_id, payload.credits)
        .await?;
    info!(%operator, user_id = %user.platform_id, credits = payload.credits, balance, "credits granted");
    counter!("gateway_requests_total", "route" => "admin_grant", "status" => "ok").increment(1);

    let notification = Notification::CreditsGranted {
        user_id: user.platform_id,
        credits: payload.credits,
        balance,
    };
    if let Err(err) = state.notifier().notify(notification).await {
        warn!(user_id = %user.platform_id, ?err, "failed to announce granted credits");
    }
    Ok(HttpResponse::Ok().json(GrantResponse {
        platform_id: user.platform_id.get(),
        balance,
    }))
}

pub async fn ban_handler(
    state: web::Data<AppState>,
    request: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    set_banned(&state, &request, &path, true).await
}

pub async fn unban_handler(
    state: web::Data<AppState>,
    request: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    set_banned(&state, &request, &path, false).await
}

async fn set_banned(
    state: &AppState,
    request: &HttpRequest,
    raw: &str,
    banned: bool,
) -> Result<HttpResponse, ApiError> {
    let operator = require_operator(state, request)?;
    let user = resolve(state, raw).await?;
    let updated = state
        .storage()
        .set_banned(user.platform_id, banned)
        .await?
        .ok_or(ApiError::UnknownUser)?;
    info!(%operator, user_id = %updated.platform_id, banned, "ban flag updated");
    Ok(HttpResponse::Ok().json(UserView::from(updated)))
}

pub async fn stats_handler(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    require_operator(&state, &request)?;
    let stats = state.storage().ledger_stats().await?;
    Ok(HttpResponse::Ok().json(stats))
}
