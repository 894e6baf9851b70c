//! Versioned access to the MariaDbCluster status
//!
//! Status is fetched fresh and written back only if the object's
//! `resourceVersion` is unchanged. Nothing caches it between passes.

use async_trait::async_trait;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use tracing::{debug, warn};

use crate::crd::{MariaDbCluster, MariaDbClusterStatus};
use crate::error::{Error, Result};

use super::detector::DesiredPrimaryWriter;

/// Field manager for every write the operator makes
pub const FIELD_MANAGER: &str = "mariadb-failover-operator";

/// Conflicting writes are retried this many times before giving up
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// Status together with the object version it was read at
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VersionedStatus {
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    pub desired_primary_index: i32,
    pub status: MariaDbClusterStatus,
}

impl VersionedStatus {
    pub fn from_cluster(cluster: &MariaDbCluster) -> Self {
        Self {
            resource_version: cluster.resource_version(),
            generation: cluster.metadata.generation,
            desired_primary_index: cluster.desired_primary_index(),
            status: cluster.status.clone().unwrap_or_default(),
        }
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn fetch(&self) -> Result<VersionedStatus>;

    /// Replace the status if the object is still at `expected_version`.
    ///
    /// A lost race yields `Error::ConcurrentModification`.
    async fn write(
        &self,
        expected_version: Option<&str>,
        status: &MariaDbClusterStatus,
    ) -> Result<()>;
}

/// Read-modify-write the status, retrying conflicts against a fresh read.
///
/// `mutate` is re-applied to every fresh copy, so it must derive its changes
/// from the status it is handed. Returns the status as written (or as found,
/// if `mutate` changed nothing).
pub async fn update_status<F>(store: &dyn StatusStore, mut mutate: F) -> Result<MariaDbClusterStatus>
where
    F: FnMut(&mut MariaDbClusterStatus) + Send,
{
    let mut last_conflict = String::new();
    for attempt in 0..MAX_CONFLICT_RETRIES {
        let current = store.fetch().await?;
        let mut next = current.status.clone();
        mutate(&mut next);
        if next == current.status {
            return Ok(next);
        }
        match store
            .write(current.resource_version.as_deref(), &next)
            .await
        {
            Ok(()) => return Ok(next),
            Err(Error::ConcurrentModification(msg)) => {
                debug!("Status write conflict (attempt {}): {}", attempt + 1, msg);
                last_conflict = msg;
            }
            Err(e) => return Err(e),
        }
    }
    warn!(
        "Giving up on status write after {} conflicts",
        MAX_CONFLICT_RETRIES
    );
    Err(Error::ConcurrentModification(last_conflict))
}

/// `StatusStore` and `DesiredPrimaryWriter` over the Kubernetes API
#[derive(Clone)]
pub struct KubeStatusStore {
    api: Api<MariaDbCluster>,
    name: String,
}

impl KubeStatusStore {
    pub fn new(client: &Client, cluster: &MariaDbCluster) -> Self {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        Self {
            api: Api::namespaced(client.clone(), &namespace),
            name: cluster.name_any(),
        }
    }
}

fn map_conflict(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 409 => Error::ConcurrentModification(
            format!("{} changed since it was read: {}", name, response.message),
        ),
        other => Error::KubeError(other),
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn fetch(&self) -> Result<VersionedStatus> {
        let cluster = self.api.get(&self.name).await?;
        Ok(VersionedStatus::from_cluster(&cluster))
    }

    async fn write(
        &self,
        expected_version: Option<&str>,
        status: &MariaDbClusterStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": expected_version },
            "status": status,
        });
        self.api
            .patch_status(
                &self.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| map_conflict(e, &self.name))?;
        Ok(())
    }
}

#[async_trait]
impl DesiredPrimaryWriter for KubeStatusStore {
    async fn set_desired_primary(&self, expected_version: Option<&str>, index: i32) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": expected_version },
            "spec": { "replication": { "primary": { "podIndex": index } } },
        });
        self.api
            .patch(
                &self.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| map_conflict(e, &self.name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fakes::{new_journal, FakeStatusStore};

    #[tokio::test]
    async fn test_update_status_retries_conflicts_with_fresh_read() {
        let journal = new_journal();
        let store = FakeStatusStore::new(journal.clone(), MariaDbClusterStatus::default(), 0);
        store.inject_conflicts(2);

        let written = update_status(&store, |s| s.primary_probe_failures += 1)
            .await
            .unwrap();

        assert_eq!(written.primary_probe_failures, 1);
        assert_eq!(store.current().status.primary_probe_failures, 1);
        assert_eq!(store.write_attempts(), 3);
    }

    #[tokio::test]
    async fn test_update_status_gives_up_after_bound() {
        let journal = new_journal();
        let store = FakeStatusStore::new(journal, MariaDbClusterStatus::default(), 0);
        store.inject_conflicts(MAX_CONFLICT_RETRIES as u32 + 1);

        let result = update_status(&store, |s| s.primary_probe_failures = 3).await;

        assert!(matches!(result, Err(Error::ConcurrentModification(_))));
        assert_eq!(store.current().status.primary_probe_failures, 0);
    }

    #[tokio::test]
    async fn test_update_status_skips_unchanged_write() {
        let journal = new_journal();
        let store = FakeStatusStore::new(journal, MariaDbClusterStatus::default(), 0);

        update_status(&store, |_| {}).await.unwrap();

        assert_eq!(store.write_attempts(), 0);
    }
}
