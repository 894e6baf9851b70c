//! Traffic coordination for primary changes
//!
//! Two backing systems are driven here:
//! - the stable primary Service, which selects whichever pod carries the
//!   primary role label, and
//! - an optional edge gateway that proxies raw TCP. Rebinding the Service
//!   cannot evict sessions the gateway already holds, so existing connections
//!   are only severed by recycling the gateway's pods.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, Resource, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::crd::{GatewayConfig, GatewayKind, MariaDbCluster};
use crate::error::{Error, Result};

use super::sql::NodeAddress;
use super::status::FIELD_MANAGER;
use super::wait::poll_until_success_or_cancelled;

/// Label the primary Service selects on
pub const ROLE_LABEL: &str = "mariadb.failover.dev/role";
pub const ROLE_PRIMARY: &str = "primary";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
const GATEWAY_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[async_trait]
pub trait TrafficCoordinator: Send + Sync {
    /// Whether an edge gateway is configured for this cluster
    fn has_gateway(&self) -> bool;

    /// Create or update the stable primary endpoint
    async fn ensure_primary_service(&self) -> Result<()>;

    /// Stop admitting new connections to `old_primary`.
    ///
    /// Established sessions are untouched.
    async fn drain_new_connections(&self, old_primary: &NodeAddress) -> Result<()>;

    /// Recycle the gateway so sessions still pinned to `old_primary` are closed
    async fn terminate_existing_connections(&self, old_primary: &NodeAddress) -> Result<()>;

    /// Wait until every gateway instance is back and Ready
    async fn wait_ready(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()>;

    /// Point the stable endpoint at `new_primary` only
    async fn rebind_primary(&self, new_primary: &NodeAddress) -> Result<()>;

    /// Pod the stable endpoint currently resolves to
    async fn current_binding(&self) -> Result<Option<String>>;
}

/// `TrafficCoordinator` backed by a Service selector and a gateway workload
pub struct KubeTrafficCoordinator {
    client: Client,
    cluster: MariaDbCluster,
    namespace: String,
    gateway: Option<GatewayConfig>,
    http: reqwest::Client,
}

impl KubeTrafficCoordinator {
    pub fn new(client: Client, cluster: &MariaDbCluster) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self {
            client,
            namespace: cluster.namespace().unwrap_or_else(|| "default".to_string()),
            gateway: cluster.gateway_config(),
            cluster: cluster.clone(),
            http,
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn primary_selector(&self) -> BTreeMap<String, String> {
        let mut selector = BTreeMap::new();
        selector.insert(INSTANCE_LABEL.to_string(), self.cluster.name_any());
        selector.insert(ROLE_LABEL.to_string(), ROLE_PRIMARY.to_string());
        selector
    }

    async fn labelled_primaries(&self) -> Result<Vec<Pod>> {
        let label_selector = format!(
            "{}={},{}={}",
            INSTANCE_LABEL,
            self.cluster.name_any(),
            ROLE_LABEL,
            ROLE_PRIMARY
        );
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&label_selector))
            .await?;
        Ok(pods.items)
    }

    fn gateway_namespace(&self, gateway: &GatewayConfig) -> String {
        gateway
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone())
    }

    /// Label selector of the gateway workload's pods
    async fn gateway_selector(&self, gateway: &GatewayConfig) -> Result<String> {
        let namespace = self.gateway_namespace(gateway);
        let match_labels = match gateway.kind {
            GatewayKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
                api.get(&gateway.name)
                    .await?
                    .spec
                    .and_then(|s| s.selector.match_labels)
            }
            GatewayKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
                api.get(&gateway.name)
                    .await?
                    .spec
                    .and_then(|s| s.selector.match_labels)
            }
        };
        let match_labels = match_labels.filter(|l| !l.is_empty()).ok_or_else(|| {
            Error::TrafficCoordinatorError(format!(
                "{} {}/{} has no matchLabels",
                gateway.kind, namespace, gateway.name
            ))
        })?;
        Ok(match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","))
    }

    async fn gateway_pods(&self, gateway: &GatewayConfig) -> Result<Vec<Pod>> {
        let selector = self.gateway_selector(gateway).await?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.gateway_namespace(gateway));
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    /// Rollout counters of the gateway workload
    async fn gateway_rollout(&self, gateway: &GatewayConfig) -> Result<RolloutState> {
        let namespace = self.gateway_namespace(gateway);
        let state = match gateway.kind {
            GatewayKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
                let deployment = api.get(&gateway.name).await?;
                let status = deployment.status.unwrap_or_default();
                RolloutState {
                    generation: deployment.metadata.generation.unwrap_or(0),
                    observed_generation: status.observed_generation.unwrap_or(0),
                    desired: deployment.spec.and_then(|s| s.replicas).unwrap_or(1),
                    updated: status.updated_replicas.unwrap_or(0),
                    ready: status.ready_replicas.unwrap_or(0),
                }
            }
            GatewayKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
                let statefulset = api.get(&gateway.name).await?;
                let status = statefulset.status.unwrap_or_default();
                RolloutState {
                    generation: statefulset.metadata.generation.unwrap_or(0),
                    observed_generation: status.observed_generation.unwrap_or(0),
                    desired: statefulset.spec.and_then(|s| s.replicas).unwrap_or(1),
                    updated: status.updated_replicas.unwrap_or(0),
                    ready: status.ready_replicas.unwrap_or(0),
                }
            }
        };
        Ok(state)
    }

    async fn gateway_ready_once(&self, gateway: &GatewayConfig) -> Result<()> {
        let rollout = self.gateway_rollout(gateway).await?;
        if !rollout.is_complete() {
            return Err(Error::TrafficCoordinatorError(format!(
                "gateway {} rollout in progress: {}",
                gateway.name, rollout
            )));
        }
        let pods = self.gateway_pods(gateway).await?;
        if pods.is_empty() {
            return Err(Error::TrafficCoordinatorError(
                "no gateway pods found".to_string(),
            ));
        }
        if let Some(pod) = pods.iter().find(|p| !pod_is_ready(p)) {
            return Err(Error::TrafficCoordinatorError(format!(
                "gateway pod {} not ready",
                pod.name_any()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TrafficCoordinator for KubeTrafficCoordinator {
    fn has_gateway(&self) -> bool {
        self.gateway.is_some()
    }

    async fn ensure_primary_service(&self) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = self.cluster.primary_service_name();
        let selector = self.primary_selector();

        let ports = vec![ServicePort {
            name: Some("mariadb".to_string()),
            port: self.cluster.spec.port,
            target_port: Some(IntOrString::Int(self.cluster.spec.port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }];

        let mut labels = BTreeMap::new();
        labels.insert(INSTANCE_LABEL.to_string(), self.cluster.name_any());

        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                owner_references: self
                    .cluster
                    .controller_owner_ref(&())
                    .map(|owner| vec![owner]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(ports),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            status: None,
        };

        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&service),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, old_primary), fields(old = %old_primary.name))]
    async fn drain_new_connections(&self, old_primary: &NodeAddress) -> Result<()> {
        // Endpoint removal stops the Service from routing new sessions to it
        match set_role_label(&self.pods(), &old_primary.name, false).await {
            Ok(()) => {}
            Err(Error::KubeError(kube::Error::Api(ae))) if ae.code == 404 => {
                debug!("Pod {} is gone, nothing to unlabel", old_primary.name);
            }
            Err(e) => return Err(e),
        }

        let Some(gateway) = &self.gateway else {
            return Ok(());
        };
        let Some(admin_port) = gateway.admin_port else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for pod in self.gateway_pods(gateway).await? {
            if !pod_is_ready(&pod) {
                continue;
            }
            let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) else {
                continue;
            };
            let base_url = format!("http://{}:{}", ip, admin_port);
            if let Err(e) = drain_gateway_instance(&self.http, &base_url, &gateway.drain_path).await {
                warn!("Failed to drain gateway pod {}: {}", pod.name_any(), e);
                failures.push(pod.name_any());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::TrafficCoordinatorError(format!(
                "drain failed on gateway pods: {}",
                failures.join(", ")
            )))
        }
    }

    #[instrument(skip(self, old_primary), fields(old = %old_primary.name))]
    async fn terminate_existing_connections(&self, old_primary: &NodeAddress) -> Result<()> {
        let Some(gateway) = &self.gateway else {
            debug!("No gateway configured, nothing to recycle");
            return Ok(());
        };
        let namespace = self.gateway_namespace(gateway);
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            RESTARTED_AT_ANNOTATION: chrono::Utc::now().to_rfc3339()
                        }
                    }
                }
            }
        });
        let params = PatchParams::apply(FIELD_MANAGER);
        match gateway.kind {
            GatewayKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
                api.patch(&gateway.name, &params, &Patch::Merge(&patch)).await?;
            }
            GatewayKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
                api.patch(&gateway.name, &params, &Patch::Merge(&patch)).await?;
            }
        }
        info!(
            "Restarted gateway {} {}/{} to evict sessions to {}",
            gateway.kind, namespace, gateway.name, old_primary.name
        );
        Ok(())
    }

    async fn wait_ready(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let Some(gateway) = &self.gateway else {
            return Ok(());
        };
        let timeout = timeout.min(Duration::from_secs(gateway.ready_timeout_seconds));
        poll_until_success_or_cancelled(cancel, GATEWAY_POLL_INTERVAL, timeout, move || {
            self.gateway_ready_once(gateway)
        })
        .await
        .map_err(|e| match e {
            Error::DeadlineExceeded { last_error } => Error::TrafficCoordinatorError(format!(
                "gateway not ready within {:?}: {}",
                timeout, last_error
            )),
            other => other,
        })
    }

    #[instrument(skip(self, new_primary), fields(new = %new_primary.name))]
    async fn rebind_primary(&self, new_primary: &NodeAddress) -> Result<()> {
        let pods = self.pods();
        // unlabel first so two pods are never selected at once
        for pod in self.labelled_primaries().await? {
            if pod.name_any() != new_primary.name {
                set_role_label(&pods, &pod.name_any(), false).await?;
            }
        }
        set_role_label(&pods, &new_primary.name, true).await?;
        info!("Primary endpoint bound to {}", new_primary.name);
        Ok(())
    }

    async fn current_binding(&self) -> Result<Option<String>> {
        let labelled = self.labelled_primaries().await?;
        match labelled.as_slice() {
            [] => Ok(None),
            [pod] => Ok(Some(pod.name_any())),
            many => Err(Error::TrafficCoordinatorError(format!(
                "{} pods carry the primary label: {}",
                many.len(),
                many.iter()
                    .map(|p| p.name_any())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// Rollout counters of a Deployment or StatefulSet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RolloutState {
    pub generation: i64,
    pub observed_generation: i64,
    pub desired: i32,
    pub updated: i32,
    pub ready: i32,
}

impl RolloutState {
    /// The controller has seen the latest template and every replica runs it
    pub fn is_complete(&self) -> bool {
        self.observed_generation >= self.generation
            && self.updated >= self.desired
            && self.ready >= self.desired
    }
}

impl std::fmt::Display for RolloutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "generation {}/{}, {} of {} updated, {} ready",
            self.observed_generation, self.generation, self.updated, self.desired, self.ready
        )
    }
}

/// Ask one gateway instance to stop accepting new connections
pub async fn drain_gateway_instance(
    http: &reqwest::Client,
    base_url: &str,
    drain_path: &str,
) -> Result<()> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), drain_path);
    debug!("POST {}", url);
    http.post(&url)
        .send()
        .await
        .map_err(Error::HttpError)?
        .error_for_status()
        .map_err(Error::HttpError)?;
    Ok(())
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// Add or remove the primary role label on one pod
async fn set_role_label(api: &Api<Pod>, pod_name: &str, primary: bool) -> Result<()> {
    let value = if primary {
        serde_json::Value::String(ROLE_PRIMARY.to_string())
    } else {
        serde_json::Value::Null
    };
    let patch = serde_json::json!({
        "metadata": {
            "labels": {
                ROLE_LABEL: value
            }
        }
    });
    api.patch(
        pod_name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    debug!("Set {}={} on {}", ROLE_LABEL, primary, pod_name);
    Ok(())
}
