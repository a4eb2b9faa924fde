//! Run trigger endpoint handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::cron::CronScheduler;
use crate::mailbox::DEFAULT_SEQUENCE;
use crate::sync::{RunError, RunOptions};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub scheduler: Arc<CronScheduler>,
}

impl AppState {
    pub fn new(config: Config, scheduler: Arc<CronScheduler>) -> Self {
        Self {
            config: Arc::new(config),
            scheduler,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cron_enabled: bool,
    pub cron_jobs: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cron_enabled: state.config.cron_enabled,
        cron_jobs: state.scheduler.job_keys().len(),
    })
}

// =============================================================================
// Run Triggers
// =============================================================================

/// Query string of the run endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    pub seq: Option<String>,
    pub mailbox: Option<String>,
    pub sync: Option<bool>,
    pub delete: Option<bool>,
}

impl RunQuery {
    fn split(self) -> (String, RunOptions) {
        let seq = self
            .seq
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SEQUENCE.to_string());
        let options = RunOptions {
            mailbox: self.mailbox.filter(|m| !m.is_empty()),
            sync: self.sync,
            delete: self.delete,
        };
        (seq, options)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub status_code: u16,
    pub data: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub status_code: u16,
    pub message: String,
}

/// Run every account.
pub async fn run_all(State(state): State<AppState>, Query(query): Query<RunQuery>) -> Response {
    let (seq, options) = query.split();
    info!(seq = %seq, mailbox = %options.mailbox(), sync = options.is_sync(), "run_all_requested");

    match state.scheduler.run_all(&seq, &options).await {
        Ok(results) => ok(&results),
        Err(e) => failure(e),
    }
}

/// Run one account.
pub async fn run_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(query): Query<RunQuery>,
) -> Response {
    let (seq, options) = query.split();
    info!(
        account_id = %account_id,
        seq = %seq,
        mailbox = %options.mailbox(),
        sync = options.is_sync(),
        "run_account_requested"
    );

    match state.scheduler.run_account(&account_id, &seq, &options).await {
        Ok(outcomes) => ok(&outcomes),
        Err(e) => failure(e),
    }
}

fn ok<T: Serialize>(data: &T) -> Response {
    match serde_json::to_value(data) {
        Ok(data) => (
            StatusCode::OK,
            Json(RunResponse {
                status_code: StatusCode::OK.as_u16(),
                data,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "run_result_serialize_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn failure(e: RunError) -> Response {
    let status = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if e.is_bad_request() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    if status.is_server_error() {
        error!(error = %e, "run_failed");
    } else {
        warn!(error = %e, status_code = status.as_u16(), "run_rejected");
    }

    error_response(status, e.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            status_code: status.as_u16(),
            message,
        }),
    )
        .into_response()
}
