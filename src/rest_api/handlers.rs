//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::api::Api;
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::crd::MariaDbCluster;

use super::dto::{
    ClusterDetailResponse, ClusterListResponse, ClusterSummary, ErrorResponse, HealthResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    (status, Json(ErrorResponse::new(code, message)))
}

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn clusters_api(state: &ControllerState) -> Api<MariaDbCluster> {
    match &state.watch_namespace {
        Some(ns) => Api::namespaced(state.client.clone(), ns),
        None => Api::all(state.client.clone()),
    }
}

async fn fetch_cluster(
    state: &ControllerState,
    namespace: &str,
    name: &str,
) -> Result<MariaDbCluster, ApiError> {
    let api: Api<MariaDbCluster> = Api::namespaced(state.client.clone(), namespace);
    match api.get(name).await {
        Ok(cluster) => Ok(cluster),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("MariaDbCluster {}/{} not found", namespace, name),
        )),
        Err(e) => {
            error!("Failed to get cluster {}/{}: {:?}", namespace, name, e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "get_failed",
                &e.to_string(),
            ))
        }
    }
}

/// List all MariaDbClusters
#[instrument(skip(state))]
pub async fn list_clusters(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<ClusterListResponse>, ApiError> {
    match clusters_api(&state).list(&Default::default()).await {
        Ok(clusters) => {
            let items: Vec<ClusterSummary> = clusters
                .items
                .iter()
                .map(ClusterSummary::from_cluster)
                .collect();
            let total = items.len();
            Ok(Json(ClusterListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list clusters: {:?}", e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "list_failed",
                &e.to_string(),
            ))
        }
    }
}

/// Get a specific MariaDbCluster
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_cluster(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ClusterDetailResponse>, ApiError> {
    let cluster = fetch_cluster(&state, &namespace, &name).await?;
    Ok(Json(ClusterDetailResponse::from_cluster(&cluster)))
}
