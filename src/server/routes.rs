//! Route definitions

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{
    chat_completions, get_job, health, job_status, stop_job, submit_job, AppState,
};

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        // job API
        .route("/jobs", post(submit_job))
        .route("/jobs/", post(submit_job))
        .route("/jobs/status/{id}", get(job_status))
        .route("/jobs/{id}", get(get_job).delete(stop_job))
        // OpenAI-compatible
        .route("/v1/chat/completions", post(chat_completions))
}
