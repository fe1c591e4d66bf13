use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{cors::{Any, CorsLayer}, services::ServeDir, trace::TraceLayer};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        id_string, AggregatesResponse, ChangeEvent, LoginInput, ResponseFilter, ResponseRecord,
        SubmissionInput, SubmissionResponse,
    },
    projections::AggregateProjector,
    realtime::{sse_handler, ws_handler},
    state::AppState,
};

pub const COMPANY_COOKIE: &str = "survey_company";

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/api/aggregates", get(get_aggregates))
        .route("/api/responses", post(create_response))
        .route("/api/login", post(login))
        .route("/sse", get(sse_handler))
        .route("/ws", get(ws_handler));

    if let Some(root) = state.config.static_root() {
        app = app.fallback_service(ServeDir::new(root));
    }

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    )
    .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Aggregated metrics for a company and/or survey. No respondent data leaves
/// this endpoint.
async fn get_aggregates(
    State(state): State<AppState>,
    Query(filter): Query<ResponseFilter>,
) -> Result<Json<AggregatesResponse>, AppError> {
    let filter = filter.normalized();
    let records = state.store.find(&filter, state.config.aggregate_limit)?;
    debug!(
        company = ?filter.company_id,
        survey = ?filter.survey_id,
        scanned = records.len(),
        "aggregating responses"
    );

    Ok(Json(AggregatesResponse {
        ok: true,
        aggregates: AggregateProjector::project(&records),
    }))
}

/// Store a submitted response, then tell every subscriber something changed.
async fn create_response(
    State(state): State<AppState>,
    payload: Result<Json<SubmissionInput>, JsonRejection>,
) -> Result<Json<SubmissionResponse>, AppError> {
    let Json(input) = payload.map_err(|e| AppError::MalformedPayload(e.body_text()))?;
    let record = build_record(input)?;

    state.store.insert(&record)?;

    let delivered = state.notifier.notify(ChangeEvent::from(&record));
    info!(
        company = %record.company_id,
        survey = %record.survey_id,
        subscribers = delivered,
        "response stored"
    );

    Ok(Json(SubmissionResponse {
        ok: true,
        response: record,
    }))
}

/// Validate a submission and stamp it with a server id and creation time.
pub fn build_record(input: SubmissionInput) -> Result<ResponseRecord, AppError> {
    let company_id = input
        .company_id
        .as_ref()
        .and_then(id_string)
        .ok_or(AppError::MissingFields)?;
    let survey_id = input
        .survey_id
        .as_ref()
        .and_then(id_string)
        .ok_or(AppError::MissingFields)?;
    let answers = input.answer_input()?.into_answers();

    Ok(ResponseRecord {
        id: Uuid::new_v4().to_string(),
        company_id,
        survey_id,
        respondent_id: input.respondent_id.as_ref().and_then(id_string),
        answers,
        created_at: Utc::now(),
    })
}

/// Dev login stub: remembers the company in an HTTP-only cookie. No
/// credentials are checked.
async fn login(payload: Result<Json<LoginInput>, JsonRejection>) -> Result<Response, AppError> {
    let Json(input) = payload.map_err(|e| AppError::MalformedPayload(e.body_text()))?;
    let company_id = input
        .company_id
        .as_ref()
        .and_then(id_string)
        .ok_or(AppError::MissingCompany)?;

    if !company_id.bytes().all(is_cookie_octet) {
        return Err(AppError::MalformedPayload(
            "companyId is not cookie-safe".to_string(),
        ));
    }

    let cookie = format!("{COMPANY_COOKIE}={company_id}; HttpOnly; Path=/; SameSite=Lax");
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|_| AppError::MalformedPayload("companyId is not cookie-safe".to_string()))?;

    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "ok": true, "companyId": company_id })),
    )
        .into_response())
}

/// RFC 6265 `cookie-octet`: visible ASCII minus `"`, `,`, `;` and `\`.
fn is_cookie_octet(byte: u8) -> bool {
    matches!(byte, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}
