use std::{future::Future, sync::Arc};

use anyhow::{Error, Result};
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    clients::{database::OutcomeStore, health::HealthChecker},
    models::{
        health::HealthStatus,
        outcome::{OutcomeRecord, OutcomeSummary},
        response::{ApiResponse, PaginationMeta},
    },
};

const DEFAULT_PAGE_LIMIT: u64 = 20;
const MAX_PAGE_LIMIT: u64 = 100;

pub struct AppState {
    pub health_checker: HealthChecker,
    pub store: Arc<dyn OutcomeStore>,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

impl PageParams {
    pub fn resolve(&self) -> (u64, u64) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        (page, limit)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/notifications", get(list_outcomes))
        .route("/notifications/summary", get(outcome_summary))
        .route("/notifications/{id}", get(get_outcome))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server<F>(state: Arc<AppState>, port: u16, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "API server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("API server stopped");

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn outcome_summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.summary().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                summary,
                "Notification summary retrieved".to_string(),
            )),
        ),
        Err(e) => {
            warn!(error = %e, "Failed to build notification summary");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<OutcomeSummary>::error(
                    e.to_string(),
                    "Failed to retrieve notification summary".to_string(),
                )),
            )
        }
    }
}

async fn get_outcome(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.find_outcome(&id).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                record,
                "Notification outcome retrieved".to_string(),
            )),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<OutcomeRecord>::error(
                format!("No outcome recorded for notification {}", id),
                "Notification not found".to_string(),
            )),
        ),
        Err(e) => {
            warn!(notification_id = %id, error = %e, "Failed to read notification outcome");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<OutcomeRecord>::error(
                    e.to_string(),
                    "Failed to retrieve notification outcome".to_string(),
                )),
            )
        }
    }
}

async fn list_outcomes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> impl IntoResponse {
    let (page, limit) = params.resolve();

    match state.store.list_outcomes(page, limit).await {
        Ok((records, total)) => (
            StatusCode::OK,
            Json(
                ApiResponse::success(records, "Notification outcomes retrieved".to_string())
                    .with_meta(PaginationMeta::new(total, page, limit)),
            ),
        ),
        Err(e) => {
            warn!(error = %e, "Failed to list notification outcomes");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<Vec<OutcomeRecord>>::error(
                    e.to_string(),
                    "Failed to retrieve notification outcomes".to_string(),
                )),
            )
        }
    }
}
