//! HTTP deploy API.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::flow::document::FlowDocument;
use crate::flow::manager::FlowManager;
use crate::flow::{DeployError, DeployMode};
use crate::registry::NodeTypeInfo;

pub const DEPLOYMENT_TYPE: &str = "Deployment-Type";

#[derive(Clone)]
pub struct AppState {
    manager: Arc<FlowManager>,
}

pub fn router(manager: Arc<FlowManager>) -> Router {
    Router::new()
        .route("/flows", get(get_flows).post(post_flows))
        .route("/nodes", get(get_nodes))
        .with_state(AppState { manager })
}

/// Serves until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    manager: Arc<FlowManager>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("deploy API listening on {addr}");
    axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("deploy API stopped");
    Ok(())
}

impl IntoResponse for DeployError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self.to_json())).into_response()
    }
}

async fn get_flows(State(state): State<AppState>) -> Json<FlowDocument> {
    Json(state.manager.flows().await)
}

async fn post_flows(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, DeployError> {
    let mode = match headers.get(DEPLOYMENT_TYPE) {
        Some(raw) => raw
            .to_str()
            .map_err(|_| DeployError::InvalidDeploymentType("<non-ascii>".to_string()))?
            .parse::<DeployMode>()?,
        None => DeployMode::Full,
    };
    let value: Value =
        serde_json::from_slice(&body).map_err(|e| DeployError::Malformed(e.to_string()))?;
    state.manager.set_flows(value, mode).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_nodes(State(state): State<AppState>) -> Json<Vec<NodeTypeInfo>> {
    Json(state.manager.registry().list())
}
