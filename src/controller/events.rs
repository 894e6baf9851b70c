//! Kubernetes Events for switchover progress

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, PostParams},
    Client, Resource, ResourceExt,
};
use tracing::warn;

use crate::crd::MariaDbCluster;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Surfaces switchover transitions and degraded-mode branches to operators
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, event_type: EventType, reason: &str, message: &str) -> Result<()>;

    async fn normal(&self, reason: &str, message: &str) {
        if let Err(e) = self.publish(EventType::Normal, reason, message).await {
            warn!("Failed to emit event {}: {}", reason, e);
        }
    }

    async fn warning(&self, reason: &str, message: &str) {
        if let Err(e) = self.publish(EventType::Warning, reason, message).await {
            warn!("Failed to emit event {}: {}", reason, e);
        }
    }
}

pub struct KubeEventRecorder {
    client: Client,
    cluster: MariaDbCluster,
}

impl KubeEventRecorder {
    pub fn new(client: Client, cluster: &MariaDbCluster) -> Self {
        Self {
            client,
            cluster: cluster.clone(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, event_type: EventType, reason: &str, message: &str) -> Result<()> {
        let namespace = self
            .cluster
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-event-", self.cluster.name_any())),
                ..Default::default()
            },
            type_: Some(event_type.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: self.cluster.object_ref(&()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            reporting_component: Some("mariadb-failover-operator".to_string()),
            ..Default::default()
        };

        events
            .create(&PostParams::default(), &event)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}
