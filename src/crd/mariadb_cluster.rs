//! MariaDbCluster Custom Resource Definition
//!
//! A `MariaDbCluster` describes an already-replicating MariaDB StatefulSet whose
//! primary the operator keeps healthy: it detects primary failure, executes
//! planned and unplanned switchovers and keeps client traffic pointed at the
//! current primary.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, CredentialsRef, GatewayConfig, GatewayKind, ReplicationConfig, SwitchoverStatus,
    TrafficConfig,
};

/// Annotation enabling gateway integration without a `spec.traffic.gateway` block.
///
/// Format: `kind/name` or `kind/namespace/name`, kind one of `deployment`, `statefulset`.
pub const GATEWAY_ANNOTATION: &str = "mariadb.failover.dev/gateway";

/// Structured validation error for `MariaDbClusterSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mariadb.failover.dev",
    version = "v1alpha1",
    kind = "MariaDbCluster",
    namespaced,
    status = "MariaDbClusterStatus",
    shortname = "mdbc",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replication.primary.podIndex"}"#,
    printcolumn = r#"{"name":"Primary","type":"string","jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.lastSwitchoverPhase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MariaDbClusterSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default = "default_port")]
    pub port: i32,

    /// Headless Service giving every pod a stable DNS name.
    /// Defaults to `<name>-internal`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless_service: Option<String>,

    /// Credentials for control connections
    pub credentials: CredentialsRef,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub traffic: TrafficConfig,

    /// When set, the operator only reports status
    #[serde(default)]
    pub suspended: bool,
}

fn default_replicas() -> i32 {
    3
}

fn default_port() -> i32 {
    3306
}

impl MariaDbClusterSpec {
    /// Validate the spec
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors: Vec<SpecValidationError> = Vec::new();

        if self.replicas < 1 {
            errors.push(SpecValidationError::new(
                "spec.replicas",
                "replicas must be at least 1",
                "Set spec.replicas to the number of MariaDB pods in the StatefulSet.",
            ));
        }

        let index = self.replication.primary.pod_index;
        if index < 0 || index >= self.replicas.max(1) {
            errors.push(SpecValidationError::new(
                "spec.replication.primary.podIndex",
                format!(
                    "podIndex {} is outside the pod range 0..{}",
                    index, self.replicas
                ),
                "Set spec.replication.primary.podIndex to the ordinal of an existing pod.",
            ));
        }

        if !(1..=65535).contains(&self.port) {
            errors.push(SpecValidationError::new(
                "spec.port",
                "port must be between 1 and 65535",
                "Set spec.port to the port MariaDB listens on (usually 3306).",
            ));
        }

        if self.credentials.name.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.credentials.name",
                "credentials Secret name must not be empty",
                "Reference the Secret holding the operator's database user.",
            ));
        }

        let timeouts = [
            ("syncTimeoutSeconds", self.replication.sync_timeout_seconds),
            ("probeTimeoutSeconds", self.replication.probe_timeout_seconds),
            ("probeIntervalSeconds", self.replication.probe_interval_seconds),
            (
                "switchoverTimeoutSeconds",
                self.replication.switchover_timeout_seconds,
            ),
            (
                "connectTimeoutSeconds",
                self.replication.connect_timeout_seconds,
            ),
            (
                "commandTimeoutSeconds",
                self.replication.command_timeout_seconds,
            ),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                errors.push(SpecValidationError::new(
                    format!("spec.replication.{}", field),
                    format!("{} must be greater than zero", field),
                    format!("Set spec.replication.{} to a positive number of seconds.", field),
                ));
            }
        }

        if let Some(gateway) = &self.traffic.gateway {
            validate_gateway(gateway, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn validate_gateway(gateway: &GatewayConfig, errors: &mut Vec<SpecValidationError>) {
    if gateway.name.trim().is_empty() {
        errors.push(SpecValidationError::new(
            "spec.traffic.gateway.name",
            "gateway name must not be empty",
            "Set spec.traffic.gateway.name to the gateway Deployment or StatefulSet name.",
        ));
    }
    if let Some(port) = gateway.admin_port {
        if !(1..=65535).contains(&port) {
            errors.push(SpecValidationError::new(
                "spec.traffic.gateway.adminPort",
                "adminPort must be between 1 and 65535",
                "Set spec.traffic.gateway.adminPort to the gateway's admin listener port or remove it.",
            ));
        }
    }
    if !gateway.drain_path.starts_with('/') {
        errors.push(SpecValidationError::new(
            "spec.traffic.gateway.drainPath",
            "drainPath must start with '/'",
            "Use an absolute path such as /drain_listeners?graceful.",
        ));
    }
    if gateway.ready_timeout_seconds == 0 {
        errors.push(SpecValidationError::new(
            "spec.traffic.gateway.readyTimeoutSeconds",
            "readyTimeoutSeconds must be greater than zero",
            "Set spec.traffic.gateway.readyTimeoutSeconds to a positive number of seconds.",
        ));
    }
}

/// Parse the gateway annotation value.
///
/// Returns `None` for any shape other than `kind/name` or `kind/namespace/name`.
pub fn parse_gateway_annotation(value: &str) -> Option<GatewayConfig> {
    let parts: Vec<&str> = value.split('/').map(str::trim).collect();
    let (kind, namespace, name) = match parts.as_slice() {
        [kind, name] => (*kind, None, *name),
        [kind, namespace, name] => (*kind, Some(namespace.to_string()), *name),
        _ => return None,
    };
    if name.is_empty() || namespace.as_deref() == Some("") {
        return None;
    }
    let kind = GatewayKind::parse(kind)?;
    Some(GatewayConfig::new(kind, name, namespace))
}

impl MariaDbCluster {
    /// Gateway configuration from the spec, falling back to the annotation
    pub fn gateway_config(&self) -> Option<GatewayConfig> {
        if let Some(gateway) = &self.spec.traffic.gateway {
            return Some(gateway.clone());
        }
        self.annotations()
            .get(GATEWAY_ANNOTATION)
            .filter(|v| !v.trim().is_empty())
            .and_then(|v| parse_gateway_annotation(v))
    }

    /// Ordinal the operator should converge on
    pub fn desired_primary_index(&self) -> i32 {
        self.spec.replication.primary.pod_index
    }

    /// Ordinal currently recorded as primary, if any
    pub fn observed_primary_index(&self) -> Option<i32> {
        self.status.as_ref().and_then(|s| s.current_primary_index)
    }

    pub fn pod_name(&self, index: i32) -> String {
        format!("{}-{}", self.name_any(), index)
    }

    pub fn headless_service_name(&self) -> String {
        self.spec
            .headless_service
            .clone()
            .unwrap_or_else(|| format!("{}-internal", self.name_any()))
    }

    pub fn primary_service_name(&self) -> String {
        self.spec
            .traffic
            .primary_service
            .clone()
            .unwrap_or_else(|| format!("{}-primary", self.name_any()))
    }

    /// Stable per-pod DNS name served by the headless Service
    pub fn pod_host(&self, index: i32) -> String {
        let namespace = self.namespace().unwrap_or_else(|| "default".to_string());
        format!(
            "{}.{}.{}.svc.cluster.local",
            self.pod_name(index),
            self.headless_service_name(),
            namespace
        )
    }
}

/// Observed state of a MariaDbCluster.
///
/// Optional fields serialize as `null` so merge patches clear them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MariaDbClusterStatus {
    /// Ordinal of the primary. Only a completed switchover changes it.
    #[serde(default)]
    pub current_primary_index: Option<i32>,

    /// Pod name of the primary
    #[serde(default)]
    pub current_primary: Option<String>,

    /// RFC 3339 time of the first failed primary probe in the current failure streak
    #[serde(default)]
    pub current_primary_failing_since: Option<String>,

    /// Consecutive failed primary probes
    #[serde(default)]
    pub primary_probe_failures: u32,

    /// Name of the last switchover phase that finished
    #[serde(default)]
    pub last_switchover_phase: Option<String>,

    /// Attempt bookkeeping while observed and desired primaries differ
    #[serde(default)]
    pub switchover: Option<SwitchoverStatus>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub message: Option<String>,
}
