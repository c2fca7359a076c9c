//! `POST /push-event`: one-shot HTTP ingress for producers without a socket.

use crate::protocol::PushEventRequest;
use crate::ws_server::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Header carrying the publish key.
pub const API_KEY_HEADER: &str = "apikey";

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    let body = ErrorResponse {
        error: error.into(),
        status: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

pub async fn push_event_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let gateway = &state.gateway;

    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if gateway.verifier().verify_publish(api_key).is_err() {
        counter!("gateway_push_requests_total", "result" => "forbidden").increment(1);
        warn!("Rejected push-event: invalid API key");
        return error_response(StatusCode::FORBIDDEN, "Invalid API key");
    }

    let request: PushEventRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            counter!("gateway_push_requests_total", "result" => "invalid").increment(1);
            return error_response(StatusCode::BAD_REQUEST, format!("Malformed body: {}", e));
        }
    };

    match gateway.router().route_push(request).await {
        Ok(tracking_id) => {
            counter!("gateway_push_requests_total", "result" => "ok").increment(1);
            info!("Accepted push-event with trackingId: {}", tracking_id);
            (StatusCode::CREATED, Json(json!({ "trackingId": tracking_id }))).into_response()
        }
        Err(e) if e.is_client_error() => {
            counter!("gateway_push_requests_total", "result" => "invalid").increment(1);
            error_response(StatusCode::BAD_REQUEST, e.client_reason())
        }
        Err(e) => {
            counter!("gateway_push_requests_total", "result" => "failed").increment(1);
            warn!("push-event failed: {}", e);
            error_response(StatusCode::UNPROCESSABLE_ENTITY, e.client_reason())
        }
    }
}
