use actix_web::{web, HttpResponse};
use cardsmith_domain::model::{GenerationRequest, MediaRef, UserId};
use cardsmith_domain::services::{ConversationError, ConversationState, SelectionFlow};
use cardsmith_domain::storage::CatalogStore;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::generate::{spawn_request, AcceptedResponse};
use super::{active_user, ApiError};

#[derive(Debug, Deserialize, Serialize)]
pub struct StartRequest {
    pub flow: SelectionFlow,
    pub image: MediaRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ElementView {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub flow: SelectionFlow,
    pub elements: Vec<ElementView>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ToggleRequest {
    pub element_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SelectionResponse {
    pub selected: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub selection_dropped: bool,
    pub generation_cancelled: bool,
}

pub async fn start_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    payload: web::Json<StartRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = UserId::new(path.into_inner());
    active_user(&state, user).await?;
    let StartRequest { flow, image } = payload.into_inner();
    if !image.is_fetchable() {
        return Err(ApiError::Validation("image must be an http(s) url".into()));
    }

    let elements = state
        .storage()
        .catalog_entries(flow.catalog_kind())
        .await?
        .into_iter()
        .map(|entry| ElementView {
            id: entry.id,
            title: entry.title,
        })
        .collect::<Vec<_>>();
    if elements.is_empty() {
        return Err(ApiError::Validation(format!(
            "no {} elements are available",
            flow.catalog_kind()
        )));
    }
    state.conversations().start_selection(user, flow, image)?;
    Ok(HttpResponse::Ok().json(StartResponse { flow, elements }))
}

pub async fn toggle_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    payload: web::Json<ToggleRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = UserId::new(path.into_inner());
    let flow = match state.conversations().get(user) {
        Some(ConversationState::Selecting { flow, .. }) => flow,
        Some(ConversationState::Generating { .. }) => return Err(ConversationError::Busy.into()),
        None => return Err(ConversationError::NoSelection.into()),
    };
    let element = state
        .storage()
        .catalog_entry(payload.element_id)
        .await?
        .filter(|entry| entry.is_active && entry.kind == flow.catalog_kind())
        .ok_or(ApiError::NotFound)?;

    let selected = state.conversations().toggle(user, element.id)?;
    Ok(HttpResponse::Ok().json(SelectionResponse {
        selected: selected.into_iter().collect(),
    }))
}

pub async fn confirm_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let user = UserId::new(path.into_inner());
    active_user(&state, user).await?;
    let selection = state.conversations().confirm_selection(user)?;

    let kind = selection.flow.task_kind();
    let run = selection.run;
    let request = match selection.flow {
        SelectionFlow::Scene => GenerationRequest::PhotoScene {
            image: selection.image,
            element_ids: selection.element_ids,
        },
        SelectionFlow::Pose => GenerationRequest::PhotoPose {
            image: selection.image,
            element_ids: selection.element_ids,
        },
    };
    spawn_request(state.get_ref().clone(), user, run, request);
    Ok(HttpResponse::Accepted().json(AcceptedResponse {
        status: "accepted".into(),
        kind,
    }))
}

/// Drops a pending selection, or signals a running generation to stop. A
/// running generation keeps the user marked busy until it has settled.
pub async fn cancel_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let user = UserId::new(path.into_inner());
    let response = match state.conversations().get(user) {
        Some(ConversationState::Generating { .. }) => CancelResponse {
            selection_dropped: false,
            generation_cancelled: state.cancel_request(user),
        },
        Some(ConversationState::Selecting { .. }) => CancelResponse {
            selection_dropped: state.conversations().cancel(user).is_some(),
            generation_cancelled: false,
        },
        None => CancelResponse {
            selection_dropped: false,
            generation_cancelled: false,
        },
    };
    Ok(HttpResponse::Ok().json(response))
}
