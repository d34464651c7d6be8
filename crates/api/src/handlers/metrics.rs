use actix_web::{web::Data, HttpResponse};
use metrics::gauge;

use crate::state::AppState;

/// Prometheus text exposition, refreshed with the gateway's cache gauges.
pub async fn metrics_handler(state: Data<AppState>) -> HttpResponse {
    gauge!("gateway_media_entries").set(state.media().len() as f64);
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.telemetry().render_metrics())
}
