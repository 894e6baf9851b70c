//! Request and response bodies for the REST API

use serde::{Deserialize, Serialize};

use crate::crd::{Condition, MariaDbCluster, SwitchoverStatus};
use kube::ResourceExt;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub desired_primary_index: i32,
    pub current_primary_index: Option<i32>,
    pub ready: bool,
}

impl ClusterSummary {
    pub fn from_cluster(cluster: &MariaDbCluster) -> Self {
        let ready = cluster
            .status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);
        Self {
            name: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            replicas: cluster.spec.replicas,
            desired_primary_index: cluster.desired_primary_index(),
            current_primary_index: cluster.observed_primary_index(),
            ready,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClusterListResponse {
    pub items: Vec<ClusterSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetailResponse {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub desired_primary_index: i32,
    pub current_primary_index: Option<i32>,
    pub current_primary: Option<String>,
    pub current_primary_failing_since: Option<String>,
    pub last_switchover_phase: Option<String>,
    pub switchover: Option<SwitchoverStatus>,
    pub conditions: Vec<Condition>,
    pub message: Option<String>,
}

impl ClusterDetailResponse {
    pub fn from_cluster(cluster: &MariaDbCluster) -> Self {
        let status = cluster.status.clone().unwrap_or_default();
        Self {
            name: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            replicas: cluster.spec.replicas,
            desired_primary_index: cluster.desired_primary_index(),
            current_primary_index: status.current_primary_index,
            current_primary: status.current_primary,
            current_primary_failing_since: status.current_primary_failing_since,
            last_switchover_phase: status.last_switchover_phase,
            switchover: status.switchover,
            conditions: status.conditions,
            message: status.message,
        }
    }
}
