//! Operator API: REST endpoints plus a WebSocket stream of dispatch events.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DispatchError;
use crate::model::{Contact, canonicalize_phone};
use crate::pipeline::{InboundMessage, MessageProcessor, OutboundRequest, PipelineOutcome};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<MessageProcessor>,
    pub clock: Arc<dyn Clock>,
}

/// Build the Axum router with the operator REST routes and the event stream.
pub fn api_routes(processor: Arc<MessageProcessor>, clock: Arc<dyn Clock>) -> Router {
    let state = AppState { processor, clock };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/rate-limits/{contact_id}", get(rate_limit_status))
        .route("/api/master-switch", get(get_master_switch).put(set_master_switch))
        .route("/api/inbound", post(inbound))
        .route("/api/outbound", post(outbound))
        .route("/api/queue", get(list_queue))
        .route("/api/queue/{id}/retry", post(retry_item))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let processor = &state.processor;
    Json(serde_json::json!({
        "status": "ok",
        "service": "engage-dispatch",
        "degraded": processor.limiter().is_degraded(),
        "automation_enabled": processor.matcher().master_switch().is_enabled(),
        "queue_depth": processor.queue().depth().await,
        "gateway": processor.queue().gateway_name(),
    }))
}

// ── Rate limits ─────────────────────────────────────────────────────────

async fn rate_limit_status(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let Some(contact_id) = canonicalize_phone(&raw) else {
        return error_body(StatusCode::BAD_REQUEST, "Invalid contact id");
    };

    let contact = match state.processor.repository().get_contact(&contact_id).await {
        Ok(Some(contact)) => contact,
        // Unknown contacts are reported at the basic tier.
        Ok(None) => Contact::new(&contact_id, state.clock.now()),
        Err(e) => return error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    Json(state.processor.limiter().status(&contact).await).into_response()
}

// ── Master switch ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct MasterSwitchBody {
    enabled: bool,
}

async fn get_master_switch(State(state): State<AppState>) -> impl IntoResponse {
    Json(MasterSwitchBody {
        enabled: state.processor.matcher().master_switch().is_enabled(),
    })
}

async fn set_master_switch(
    State(state): State<AppState>,
    Json(body): Json<MasterSwitchBody>,
) -> impl IntoResponse {
    let previous = state.processor.matcher().master_switch().set(body.enabled);
    info!(enabled = body.enabled, previous, "Master switch set via API");
    Json(serde_json::json!({ "enabled": body.enabled, "previous": previous }))
}

// ── Pipeline ────────────────────────────────────────────────────────────

async fn inbound(State(state): State<AppState>, Json(message): Json<InboundMessage>) -> Response {
    let outcome = state.processor.process(message).await;
    outcome_response(outcome)
}

async fn outbound(State(state): State<AppState>, Json(request): Json<OutboundRequest>) -> Response {
    let outcome = state.processor.submit_outbound(request).await;
    outcome_response(outcome)
}

/// Map an outcome to a status code. Throttled outcomes carry `Retry-After`.
fn outcome_response(outcome: PipelineOutcome) -> Response {
    let status = match &outcome {
        PipelineOutcome::Dispatched { .. } => StatusCode::ACCEPTED,
        PipelineOutcome::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        PipelineOutcome::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PipelineOutcome::Failed { stage, .. } if stage == "validation" => StatusCode::BAD_REQUEST,
        PipelineOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    let retry_after = outcome.retry_after_secs();

    let mut response = (status, Json(outcome)).into_response();
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

// ── Queue ───────────────────────────────────────────────────────────────

async fn list_queue(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.processor.queue().items().await)
}

async fn retry_item(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let item_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "Invalid queue item ID"),
    };

    match state.processor.queue().retry(item_id).await {
        Ok(item) => (StatusCode::OK, Json(item)).into_response(),
        Err(e @ DispatchError::NotFound { .. }) => error_body(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ DispatchError::InvalidTransition { .. }) => {
            error_body(StatusCode::CONFLICT, e.to_string())
        }
        Err(e @ DispatchError::Backpressure { retry_after_secs, .. }) => {
            let mut response = error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            response
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Event stream client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.processor))
}

async fn handle_socket(mut socket: WebSocket, processor: Arc<MessageProcessor>) {
    let mut rx = processor.queue().subscribe();
    info!("Event stream client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // Events are best-effort; the queue itself is the record.
                        warn!(missed = n, "Event stream client lagged behind broadcast");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Dispatch event channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Event stream connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    use crate::clock::ManualClock;
    use crate::compliance::ComplianceGate;
    use crate::config::{ComplianceConfig, DispatchConfig, RateLimitConfig};
    use crate::counter::ResilientCounterStore;
    use crate::dispatch::{DispatchQueue, LogGateway};
    use crate::ratelimit::RateLimiter;
    use crate::rules::{MasterSwitch, RuleMatcher};
    use crate::store::InMemoryRepository;

    fn router() -> Router {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap()));
        let gate = Arc::new(
            ComplianceGate::new(&ComplianceConfig::default(), repo.clone(), clock.clone()).unwrap(),
        );
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(ResilientCounterStore::local()),
            RateLimitConfig::default(),
            gate.business_hours().clone(),
            clock.clone(),
        ));
        let matcher = Arc::new(RuleMatcher::new(
            repo.clone(),
            clock.clone(),
            Arc::new(MasterSwitch::default()),
            0.7,
        ));
        let queue = DispatchQueue::new(
            DispatchConfig::default(),
            100,
            Arc::new(LogGateway),
            repo.clone(),
            clock.clone(),
        );
        let processor = Arc::new(MessageProcessor::new(
            repo,
            gate,
            limiter,
            matcher,
            queue,
            clock.clone(),
        ));
        api_routes(processor, clock)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rate_limited_outcome_sets_retry_after() {
        let response = outcome_response(PipelineOutcome::RateLimited {
            contact_id: "6281".into(),
            reason: crate::ratelimit::LimitReason::ContactMinuteLimit,
            retry_after_secs: 30,
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    }

    #[tokio::test]
    async fn master_switch_roundtrip() {
        let app = router();
        let response = app
            .clone()
            .oneshot(
                Request::put("/api/master-switch")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"enabled": false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["previous"], true);

        let response = app
            .oneshot(Request::get("/api/master-switch").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["enabled"], false);
    }

    #[tokio::test]
    async fn rate_limit_status_for_unknown_contact() {
        let response = router()
            .oneshot(Request::get("/api/rate-limits/081234").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["contact_id"], "6281234");
        assert_eq!(json["tier"], "basic");
        assert_eq!(json["windows"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn retry_rejects_bad_ids() {
        let app = router();
        let response = app
            .clone()
            .oneshot(Request::post("/api/queue/not-a-uuid/retry").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let uri = format!("/api/queue/{}/retry", Uuid::new_v4());
        let response = app
            .oneshot(Request::post(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
