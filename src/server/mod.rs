//! HTTP surface over the scheduler.

mod handlers;
mod routes;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::scheduler::Scheduler;

pub use handlers::AppState;
pub use routes::api_routes;

pub fn router(scheduler: Arc<Scheduler>) -> Router {
    let state = Arc::new(AppState::new(scheduler));
    Router::new()
        .merge(api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves, then finishes in-flight requests.
pub async fn serve<F>(listener: TcpListener, scheduler: Arc<Scheduler>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!("server listening on http://{}", addr);
    tracing::info!("  POST   /jobs/                 submit");
    tracing::info!("  DELETE /jobs/{{id}}             stop");
    tracing::info!("  GET    /jobs/status/{{id}}      status");
    tracing::info!("  GET    /jobs/{{id}}             result");
    tracing::info!("  POST   /v1/chat/completions   chat");
    tracing::info!("  GET    /health                load");

    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
