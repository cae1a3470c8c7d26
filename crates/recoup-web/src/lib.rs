//! Read-side JSON API over detection jobs and results.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use recoup_storage::{BlobStore, DetectionStore, InvalidBlobKey, RetryDisposition, StoreError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recoup-web";

const DEFAULT_RESULT_LIMIT: usize = 50;
const MAX_RESULT_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DetectionStore>,
    pub blobs: Arc<dyn BlobStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn DetectionStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ResultsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/jobs/stats", get(job_stats_handler))
        .route("/jobs/{id}", get(job_handler))
        .route("/jobs/{id}/results", get(job_results_handler))
        .route("/sellers/{seller_id}/results", get(seller_results_handler))
        .route("/results/{id}/whitelist", post(whitelist_result_handler))
        .route("/evidence/{*key}", get(evidence_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "query api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn job_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.count_jobs_by_status().await {
        Ok(counts) => {
            let by_status = counts
                .into_iter()
                .map(|(status, total)| (status.as_str().to_string(), total))
                .collect::<BTreeMap<_, _>>();
            Json(json!({ "jobs": by_status })).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn job_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_job(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => not_found("job"),
        Err(err) => store_error(err),
    }
}

async fn job_results_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.store.get_job(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("job"),
        Err(err) => return store_error(err),
    }
    match state.store.results_for_job(id).await {
        Ok(results) => Json(results).into_response(),
        Err(err) => store_error(err),
    }
}

async fn seller_results_handler(
    State(state): State<Arc<AppState>>,
    Path(seller_id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RESULT_LIMIT).clamp(1, MAX_RESULT_LIMIT);
    match state.store.results_for_seller(&seller_id, limit).await {
        Ok(results) => Json(results).into_response(),
        Err(err) => store_error(err),
    }
}

async fn whitelist_result_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.store.flag_result_whitelisted(id).await {
        Ok(true) => {
            info!(result_id = %id, "result whitelisted retroactively");
            Json(json!({ "id": id, "whitelisted": true })).into_response()
        }
        Ok(false) => not_found("result"),
        Err(err) => store_error(err),
    }
}

async fn evidence_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    match state.blobs.get_json(&key).await {
        Ok(Some(document)) => Json(document).into_response(),
        Ok(None) => not_found("evidence"),
        Err(err) => {
            let status = if err.downcast_ref::<InvalidBlobKey>().is_some() {
                StatusCode::BAD_REQUEST
            } else {
                error!(key = %key, error = %err, "evidence lookup failed");
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(json!({ "error": format!("{err:#}") }))).into_response()
        }
    }
}

fn not_found(what: &str) -> Response {
    let body = Json(json!({ "error": format!("{what} not found") }));
    (StatusCode::NOT_FOUND, body).into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store request failed");
    let status = match err.disposition() {
        RetryDisposition::Retryable => StatusCode::SERVICE_UNAVAILABLE,
        RetryDisposition::NonRetryable => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
