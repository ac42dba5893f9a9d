//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use podserve_protocol::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ErrorBody,
    JobQueuedResponse, JobResponse, JobStatus, JobStatusResponse, NewJobRequest, Role, Usage,
};

use crate::error::JobError;
use crate::scheduler::Scheduler;

/// Shared application state
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody::new(code, message))).into_response()
}

fn job_error(err: &JobError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
    error_response(status, err.code(), err.to_string())
}

fn bad_json(rejection: JsonRejection) -> Response {
    error_response(StatusCode::BAD_REQUEST, "BAD_JSON", rejection.body_text())
}

/// `POST /jobs/`
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewJobRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    let id = request.id.clone();
    match state.scheduler.submit(request) {
        Ok(()) => (
            StatusCode::OK,
            Json(JobQueuedResponse {
                id,
                status: JobStatus::Queued,
            }),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(job = %id, code = err.code(), "job rejected");
            job_error(&err)
        }
    }
}

/// `DELETE /jobs/{id}`
pub async fn stop_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.scheduler.stop(&id) {
        Ok(status) => (StatusCode::OK, Json(JobStatusResponse { status })).into_response(),
        Err(err) => job_error(&err),
    }
}

/// `GET /jobs/status/{id}`
pub async fn job_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.scheduler.status(&id) {
        Ok(status) => (StatusCode::OK, Json(JobStatusResponse { status })).into_response(),
        Err(err) => job_error(&err),
    }
}

/// `GET /jobs/{id}`
pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.scheduler.job(&id) {
        Ok(job) => (
            StatusCode::OK,
            Json(JobResponse {
                id: job.id,
                status: job.status,
                prompt: job.prompt,
                output: job.output,
            }),
        )
            .into_response(),
        Err(err @ JobError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, err.code(), err.to_string())
        }
        Err(err) => job_error(&err),
    }
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    if request.messages.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "EMPTY_MESSAGES",
            "messages must not be empty",
        );
    }

    let scheduler = Arc::clone(&state.scheduler);
    let id = match scheduler.submit_chat(&request.messages) {
        Ok(id) => id,
        Err(err) => return job_error(&err),
    };

    let timeout = scheduler.options().chat_timeout;
    let wait_id = id.clone();
    let waited = tokio::task::spawn_blocking(move || {
        scheduler.wait_for_completion(&wait_id, timeout)
    })
    .await;

    let job = match waited {
        Ok(Some(job)) => job,
        Ok(None) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "JOB_EXPIRED",
                "request expired before a pod became free",
            )
        }
        Err(err) => {
            tracing::error!(job = %id, error = %err, "chat wait task failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "chat completion wait failed",
            );
        }
    };

    let finish_reason = job.status.is_terminal().then(|| "stop".to_string());
    if finish_reason.is_none() {
        tracing::warn!(job = %job.id, status = job.status.as_str(), "chat timed out, returning partial output");
    }

    let response = ChatCompletionResponse {
        id: job.id.clone(),
        object: "chat.completion".to_string(),
        created: (job.created_at / 1000) as i64,
        model: request.model.unwrap_or_else(|| job.model_id.clone()),
        usage: Usage {
            prompt_tokens: job.prompt_tokens,
            completion_tokens: job.output_tokens,
            total_tokens: job.prompt_tokens + job.output_tokens,
        },
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::new(Role::Assistant, job.output),
            logprobs: None,
            finish_reason,
        }],
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.scheduler.health()))
}
