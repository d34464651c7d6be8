use actix_web::{web, HttpResponse};
use cardsmith_domain::model::{GenerationRequest, TaskKind, UserId};
use cardsmith_domain::services::{ConversationError, GenerationRun, Notification, RefundState};
use cardsmith_orchestrator::{OrchestratorError, RequestOutcome};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::media::content_type_for;
use crate::state::AppState;

use super::{active_user, ApiError};

#[derive(Debug, Deserialize, Serialize)]
pub struct GenerateRequest {
    pub user_id: i64,
    pub request: GenerationRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub status: String,
    pub kind: TaskKind,
}

pub async fn generate_handler(
    state: web::Data<AppState>,
    payload: web::Json<GenerateRequest>,
) -> Result<HttpResponse, ApiError> {
    let GenerateRequest { user_id, request } = payload.into_inner();
    let user = UserId::new(user_id);
    active_user(&state, user).await?;

    let kind = request.kind();
    let Some(run) = state.conversations().try_begin_generation(user, kind) else {
        counter!("gateway_requests_total", "route" => "generate", "status" => "busy").increment(1);
        return Err(ConversationError::Busy.into());
    };
    spawn_request(state.get_ref().clone(), user, run, request);
    counter!("gateway_requests_total", "route" => "generate", "status" => "accepted").increment(1);
    Ok(HttpResponse::Accepted().json(AcceptedResponse {
        status: "accepted".into(),
        kind,
    }))
}

/// Runs the request in the background and reports the outcome through the
/// notifier. The caller must already have marked the user as generating under
/// `run`. The cancel handle is registered before this returns.
pub(crate) fn spawn_request(
    state: AppState,
    user: UserId,
    run: GenerationRun,
    request: GenerationRequest,
) {
    let cancel = state.track_request(user, run);
    actix_web::rt::spawn(async move {
        let outcome = state.orchestrator().run(user, request, &cancel).await;
        state.untrack_request(user, run);
        state.conversations().finish_generation(user, run);

        let notification = notification_for(&state, user, outcome);
        if let Err(err) = state.notifier().notify(notification).await {
            warn!(%user, ?err, "failed to deliver generation outcome");
        }
    });
}

fn notification_for(state: &AppState, user_id: UserId, outcome: RequestOutcome) -> Notification {
    match outcome {
        RequestOutcome::Delivered {
            task_id,
            kind,
            artifacts,
            charged,
            balance,
        } => {
            let media_urls = artifacts
                .into_iter()
                .map(|artifact| {
                    let content_type = content_type_for(&artifact.url);
                    match state.media().put(artifact.bytes.into(), content_type) {
                        Ok(key) => state.media().url_for(&key).as_str().to_string(),
                        Err(err) => {
                            warn!(%task_id, ?err, "falling back to the remote artifact url");
                            artifact.url
                        }
                    }
                })
                .collect();
            info!(%user_id, %task_id, %kind, charged, "generation delivered");
            Notification::GenerationDelivered {
                user_id,
                task_id,
                kind,
                media_urls,
                charged,
                balance,
            }
        }
        RequestOutcome::Refunded {
            task_id,
            error,
            refunded,
        } => Notification::GenerationFailed {
            user_id,
            task_id,
            cause: error.to_string(),
            refund: if refunded > 0 {
                RefundState::Returned
            } else {
                RefundState::NotCharged
            },
        },
        RequestOutcome::RefundPending { task_id, error } => Notification::GenerationFailed {
            user_id,
            task_id,
            cause: error.to_string(),
            refund: RefundState::Pending,
        },
        RequestOutcome::Rejected {
            error: OrchestratorError::InsufficientFunds {
                required,
                available,
            },
        } => Notification::InsufficientFunds {
            user_id,
            required,
            available,
        },
        RequestOutcome::Rejected { error } => Notification::GenerationFailed {
            user_id,
            task_id: None,
            cause: error.to_string(),
            refund: RefundState::NotCharged,
        },
    }
}
