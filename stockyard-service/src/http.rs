//! HTTP front-end
//!
//! Three behaviors on one route: POST enqueues a request and returns its
//! correlation id; GET with a corr_id claims the response (blocking on the
//! store waiter while the request is still in flight); GET without one
//! reports queue depths. Anything else is 405 from the method router.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ids::CorrId;
use crate::pipeline::Priority;
use crate::state::AppState;

/// Build the front-end router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(submit).get(retrieve))
        .with_state(state)
}

/// Serve the router with the standard middleware stack until shutdown
pub async fn serve(config: &Config, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.service.host, config.service.port)
        .parse()
        .map_err(|e| Error::Internal(format!("bad bind address: {e}")))?;

    let app = router(state)
        .layer(TimeoutLayer::with_status_code(
            http::StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.service.timeout_secs),
        ))
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
        .layer(CatchPanicLayer::new());

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Front-end listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Front-end shutdown complete");
    Ok(())
}

/// POST /: decode, validate, enqueue, reply with the corr id
async fn submit(
    State(state): State<AppState>,
    body: std::result::Result<Json<crate::model::RequestWire>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let Json(wire) = body.map_err(|e| Error::BadRequest(e.to_string()))?;
    let vendor = state.pipeline.registry().get(&wire.vendor)?;
    let request = wire.decode(vendor.resources())?;
    let corr_id = state.pipeline.submit(request, Priority::Normal)?;
    tracing::debug!(corr_id = %corr_id, vendor = %wire.vendor, endpoint = %wire.endpoint, "request enqueued");
    Ok(Json(json!({ "corr_id": corr_id })))
}

#[derive(Debug, Default, Deserialize)]
struct RetrieveBody {
    corr_id: Option<CorrId>,
}

/// GET /: claim a response, or report status when no corr id is given
async fn retrieve(
    State(state): State<AppState>,
    body: Option<Json<RetrieveBody>>,
) -> Result<Json<serde_json::Value>> {
    let corr_id = body.and_then(|Json(b)| b.corr_id);
    match corr_id {
        None => Ok(Json(json!({
            "pending_requests": state.pipeline.queue().len(),
            "pending_responses": state.pipeline.store().ready_count(),
        }))),
        Some(corr_id) => match state.pipeline.store().wait(&corr_id).await {
            Some(response) => Ok(Json(serde_json::to_value(response.to_wire()).map_err(
                |e| Error::Internal(format!("response encoding: {e}")),
            )?)),
            None => Err(Error::NotFound(format!("corr_id {corr_id}"))),
        },
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
