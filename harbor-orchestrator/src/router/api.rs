//! Control-plane API, served under the reserved control-plane host.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json,
};
use log::{error, info};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::deployment::DeploymentId;
use crate::error::StoreError;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn routes(orchestrator: Arc<Orchestrator>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health_check))
        .route("/deployments", get(list_deployments).post(start_deployment))
        .route(
            "/deployments/:id",
            get(get_deployment).delete(delete_deployment),
        )
        .layer(CorsLayer::permissive())
        .with_state(ApiState { orchestrator })
}

fn error_response(status: StatusCode, msg: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({"status": "ERROR", "msg": msg.to_string()})),
    )
        .into_response()
}

fn store_error(e: StoreError) -> Response {
    let status = match &e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InUse(_) => StatusCode::CONFLICT,
        _ => {
            error!("API: store failure: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_deployments(State(state): State<ApiState>) -> Response {
    match state.orchestrator.list() {
        Ok(deployments) => {
            Json(serde_json::json!({"status": "OK", "deployments": deployments})).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<DeploymentId>() else {
        return store_error(StoreError::NotFound(id));
    };
    match state.orchestrator.get(id) {
        Ok(manifest) => {
            Json(serde_json::json!({"status": "OK", "deployment": manifest})).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn delete_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<DeploymentId>() else {
        return store_error(StoreError::NotFound(id));
    };
    match state.orchestrator.delete(id) {
        Ok(()) => Json(serde_json::json!({"status": "OK", "msg": "Deployment removed"})).into_response(),
        Err(e) => store_error(e),
    }
}

/// Deploys the current services file and streams the deployment's events as SSE frames.
///
/// The deployment keeps going if the client disconnects.
async fn start_deployment(State(state): State<ApiState>) -> Response {
    let config = match state.orchestrator.load_config() {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let handle = state.orchestrator.deploy(config);
    info!("API: deployment {} started", handle.id);

    let frames = futures::stream::unfold(handle.events, |mut events| async move {
        let event = events.recv().await?;
        let data = serde_json::to_string(&event)
            .unwrap_or_else(|e| serde_json::json!({"error": e.to_string()}).to_string());
        let frame = SseEvent::default().event(event.stage().as_str()).data(data);
        Some((Ok::<_, Infallible>(frame), events))
    });

    Sse::new(frames)
        .keep_alive(KeepAlive::default())
        .into_response()
}
