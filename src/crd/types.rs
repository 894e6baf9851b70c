//! Shared types for the MariaDbCluster CRD

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a Secret holding a database user and password
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRef {
    /// Name of the Secret in the cluster's namespace
    pub name: String,

    #[serde(default = "default_user_key")]
    pub user_key: String,

    #[serde(default = "default_password_key")]
    pub password_key: String,
}

fn default_user_key() -> String {
    "username".to_string()
}

fn default_password_key() -> String {
    "password".to_string()
}

/// Desired primary and automatic failover settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryConfig {
    /// Ordinal of the pod that should be primary.
    /// Operators request a planned switchover by changing this value.
    #[serde(default)]
    pub pod_index: i32,

    /// Let the operator rewrite `podIndex` when the primary stops answering
    #[serde(default = "default_true")]
    pub automatic_failover: bool,

    /// How long the primary must keep failing probes before a failover is requested
    #[serde(default)]
    pub automatic_failover_delay_seconds: u64,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            pod_index: 0,
            automatic_failover: true,
            automatic_failover_delay_seconds: 0,
        }
    }
}

/// What to do about replica sync when the old primary cannot be reached
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UnreachablePrimarySync {
    /// Promote immediately. The candidate may lack the primary's last transactions.
    #[default]
    Skip,
    /// Wait until the candidate has applied everything already in its relay log
    DrainRelayLog,
}

/// Replication and failover tuning
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConfig {
    #[serde(default)]
    pub primary: PrimaryConfig,

    /// Credentials replicas use to connect to the primary.
    /// Defaults to `spec.credentials`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_credentials: Option<CredentialsRef>,

    /// Bound on the wait for the candidate to catch up with the old primary
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_seconds: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,

    /// Requeue interval while the primary is suspect or failing
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,

    /// Total time an attempt series may take before manual intervention is required
    #[serde(default = "default_switchover_timeout")]
    pub switchover_timeout_seconds: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,

    #[serde(default)]
    pub unreachable_primary_sync: UnreachablePrimarySync,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            primary: PrimaryConfig::default(),
            replication_credentials: None,
            sync_timeout_seconds: default_sync_timeout(),
            probe_timeout_seconds: default_probe_timeout(),
            probe_interval_seconds: default_probe_interval(),
            switchover_timeout_seconds: default_switchover_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            command_timeout_seconds: default_command_timeout(),
            unreachable_primary_sync: UnreachablePrimarySync::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sync_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_probe_interval() -> u64 {
    5
}

fn default_switchover_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    10
}

/// Traffic layer configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficConfig {
    /// Name of the stable primary Service. Defaults to `<name>-primary`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_service: Option<String>,

    /// Edge gateway fronting the cluster for external clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,
}

/// Workload kind of the edge gateway
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum GatewayKind {
    Deployment,
    StatefulSet,
}

impl GatewayKind {
    /// Parse the lowercase form used in the gateway annotation
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployment" => Some(GatewayKind::Deployment),
            "statefulset" => Some(GatewayKind::StatefulSet),
            _ => None,
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayKind::Deployment => write!(f, "deployment"),
            GatewayKind::StatefulSet => write!(f, "statefulset"),
        }
    }
}

/// Edge gateway whose instances are recycled to evict established connections
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub kind: GatewayKind,
    pub name: String,

    /// Namespace of the gateway workload. Defaults to the cluster's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Admin port used to stop accepting new connections before recycling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_port: Option<i32>,

    #[serde(default = "default_drain_path")]
    pub drain_path: String,

    #[serde(default = "default_gateway_ready_timeout")]
    pub ready_timeout_seconds: u64,
}

impl GatewayConfig {
    pub fn new(kind: GatewayKind, name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace,
            admin_port: None,
            drain_path: default_drain_path(),
            ready_timeout_seconds: default_gateway_ready_timeout(),
        }
    }
}

fn default_drain_path() -> String {
    "/drain_listeners?graceful&inboundonly".to_string()
}

fn default_gateway_ready_timeout() -> u64 {
    120
}

/// Why a switchover was started
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SwitchoverTrigger {
    /// Requested by an operator changing the desired primary
    Planned,
    /// Requested after the primary failed its health probes
    Unplanned,
}

impl fmt::Display for SwitchoverTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchoverTrigger::Planned => write!(f, "Planned"),
            SwitchoverTrigger::Unplanned => write!(f, "Unplanned"),
        }
    }
}

/// Bookkeeping for the series of attempts towards one target primary
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SwitchoverStatus {
    pub old_index: i32,
    pub target_index: i32,
    pub trigger: SwitchoverTrigger,
    /// RFC 3339 time the first attempt for this target started
    pub started_at: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Kubernetes-style status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "PrimarySwitched")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }
}
