//! JSON trigger surface for the reconciliation engine.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use recruit_core::ParticipantCategory;
use recruit_sync::{ReconcileError, ReconciliationService};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recruit-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReconciliationService>,
}

impl AppState {
    pub fn new(service: Arc<ReconciliationService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize, Default)]
struct EvaluateQuery {
    /// Overrides the evaluation instant; defaults to the wall clock.
    now: Option<DateTime<Utc>>,
    deadline_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BackfillQuery {
    #[serde(default)]
    destructive: bool,
    investigation: Option<Uuid>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/reconciliation/run", post(run_handler))
        .route("/reconciliation/preview", get(preview_handler))
        .route("/history/{category}/backfill", post(backfill_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http listener bound");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EvaluateQuery>,
) -> Response {
    let now = query.now.unwrap_or_else(Utc::now);
    let deadline = query
        .deadline_secs
        .map(std::time::Duration::from_secs)
        .or(state.service.settings().run_deadline);
    match state
        .service
        .run_reconciliation_with_deadline(now, deadline)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn preview_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EvaluateQuery>,
) -> Response {
    let now = query.now.unwrap_or_else(Utc::now);
    match state.service.preview(now).await {
        Ok(planned) => Json(serde_json::json!({
            "evaluated_at": now,
            "transitions": planned,
        }))
        .into_response(),
        Err(err) => engine_error(err),
    }
}

async fn backfill_handler(
    State(state): State<Arc<AppState>>,
    Path(category): Path<String>,
    Query(query): Query<BackfillQuery>,
) -> Response {
    let category = match category.parse::<ParticipantCategory>() {
        Ok(category) => category,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    match state
        .service
        .run_history_backfill(category, query.destructive, query.investigation)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => engine_error(err),
    }
}

fn engine_error(err: ReconcileError) -> Response {
    error!(error = %err, "request failed");
    let status = match err {
        ReconcileError::Catalog(_) => StatusCode::CONFLICT,
        ReconcileError::CatalogLoad(_) | ReconcileError::Records(_) | ReconcileError::Store(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    json_error(status, err.to_string())
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
