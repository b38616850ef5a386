//! REST handlers: enrollment, provider webhooks, unsubscribe and health checks.

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Redirect;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use nurture_core::error::NurtureError;
use nurture_core::types::{HistoryEntry, Scenario, SessionRecord};
use nurture_journey::payment::SIGNATURE_HEADER;
use nurture_journey::{
    EnrollmentRequest, IngestSummary, NurtureEngine, PaymentOutcome, SessionState,
};

/// Maximum number of events accepted in one engagement webhook batch.
const MAX_BATCH: usize = 10_000;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: NurtureEngine,
    pub node_id: String,
    pub app_url: String,
    pub start_time: Instant,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

/// Maps domain errors onto HTTP statuses. Internal details stay in the log.
fn map_error(e: NurtureError) -> ApiError {
    let status = match &e {
        NurtureError::InvalidSignature(_) | NurtureError::MalformedPayload(_) => {
            StatusCode::BAD_REQUEST
        }
        NurtureError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        NurtureError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "Request failed");
        metrics::counter!("api.errors").increment(1);
        return api_error(status, e.kind(), "Internal processing error");
    }
    metrics::counter!("api.client_errors", "kind" => e.kind()).increment(1);
    api_error(status, e.kind(), e.to_string())
}

/// Read-only session view.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub state: SessionState,
    pub scenario: Option<Scenario>,
    pub stage: u32,
    pub paid: bool,
    pub opted_out: bool,
    pub archived: bool,
    pub lapsed_stage: Option<u32>,
    pub last_sent_at: Option<chrono::DateTime<Utc>>,
    pub history: Vec<HistoryEntry>,
}

impl From<SessionRecord> for SessionView {
    fn from(s: SessionRecord) -> Self {
        Self {
            id: s.id,
            state: SessionState::of(&s),
            scenario: s.scenario,
            stage: s.stage,
            paid: s.paid,
            opted_out: s.opted_out,
            archived: s.archived,
            lapsed_stage: s.lapsed_stage,
            last_sent_at: s.last_sent_at,
            history: s.history,
        }
    }
}

/// POST /v1/sessions: enroll a session into a nurture scenario.
pub async fn enroll_session(
    State(state): State<AppState>,
    Json(request): Json<EnrollmentRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let record = state
        .engine
        .enrollment
        .enroll(request, Utc::now())
        .await
        .map_err(map_error)?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

/// GET /v1/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    state
        .engine
        .session(&id)
        .map(|s| Json(s.into()))
        .ok_or_else(|| map_error(NurtureError::SessionNotFound(id)))
}

/// POST /v1/webhooks/sendgrid: engagement event batch.
///
/// The body is parsed by hand so that a non-array payload is a 400 rather
/// than the extractor's 422. Individual bad events never fail the batch.
pub async fn sendgrid_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestSummary>, ApiError> {
    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Engagement webhook is not JSON");
        api_error(StatusCode::BAD_REQUEST, "malformed_payload", "body is not JSON")
    })?;
    let serde_json::Value::Array(events) = payload else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "malformed_payload",
            "expected a JSON array of events",
        ));
    };
    if events.len() > MAX_BATCH {
        return Err(api_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "batch_too_large",
            format!("at most {MAX_BATCH} events per batch"),
        ));
    }

    Ok(Json(state.engine.correlator.ingest(&events)))
}

/// POST /v1/webhooks/stripe: signed payment completion.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PaymentOutcome>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    state
        .engine
        .payments
        .handle(signature, &body, Utc::now())
        .await
        .map(Json)
        .map_err(map_error)
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeParams {
    pub token: String,
}

/// GET /v1/unsubscribe?token=: opt out from the email footer link.
pub async fn unsubscribe(
    State(state): State<AppState>,
    Query(params): Query<UnsubscribeParams>,
) -> Result<Redirect, ApiError> {
    let id = Uuid::parse_str(params.token.trim()).map_err(|_| {
        api_error(StatusCode::BAD_REQUEST, "invalid_token", "unsubscribe token is not valid")
    })?;
    state
        .engine
        .enrollment
        .unsubscribe(id, Utc::now())
        .map_err(map_error)?;
    Ok(Redirect::to(&format!(
        "{}/unsubscribe?success=true",
        state.app_url.trim_end_matches('/')
    )))
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        sessions: state.engine.store.len(),
    })
}

/// GET /live: Liveness check.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub sessions: usize,
}
