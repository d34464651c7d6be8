use actix_web::{web, HttpResponse};
use cardsmith_domain::model::{format_minor_amount, Credits, UserId};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::{active_user, ApiError};

#[derive(Debug, Serialize, Deserialize)]
pub struct PackageView {
    pub index: usize,
    pub amount: String,
    pub credits: Credits,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreatePaymentRequest {
    pub user_id: i64,
    /// Position in the configured package list.
    pub package: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatePaymentResponse {
    pub payment_id: String,
    pub pay_url: String,
    pub credits: Credits,
}

pub async fn packages_handler(state: web::Data<AppState>) -> HttpResponse {
    let packages = state
        .packages()
        .iter()
        .enumerate()
        .map(|(index, package)| PackageView {
            index,
            amount: format_minor_amount(package.amount_minor),
            credits: package.credits,
        })
        .collect::<Vec<_>>();
    HttpResponse::Ok().json(packages)
}

pub async fn create_payment_handler(
    state: web::Data<AppState>,
    payload: web::Json<CreatePaymentRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = UserId::new(payload.user_id);
    active_user(&state, user).await?;
    let package = *state
        .packages()
        .get(payload.package)
        .ok_or_else(|| ApiError::Validation(format!("unknown package {}", payload.package)))?;

    let top_up = state.top_ups().start(user, package).await.inspect_err(|_| {
        counter!("gateway_requests_total", "route" => "payments", "status" => "error").increment(1);
    })?;
    counter!("gateway_requests_total", "route" => "payments", "status" => "created").increment(1);
    Ok(HttpResponse::Created().json(CreatePaymentResponse {
        payment_id: top_up.payment_id.into_inner(),
        pay_url: top_up.pay_url,
        credits: top_up.credits,
    }))
}
