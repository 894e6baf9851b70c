//! One level-triggered reconciliation pass over a MariaDbCluster
//!
//! The pass compares the observed primary (status) with the desired primary
//! (spec) and either runs routine health checks or a switchover attempt. All
//! collaborators are trait objects and the clock is supplied by the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::crd::{MariaDbCluster, SwitchoverStatus, SwitchoverTrigger};
use crate::error::{Error, Result};

use super::conditions::{
    find_condition, is_condition_true, set_condition, CONDITION_STATUS_FALSE,
    CONDITION_STATUS_TRUE, CONDITION_TYPE_DEGRADED, CONDITION_TYPE_NEEDS_MANUAL_INTERVENTION,
    CONDITION_TYPE_READY,
};
use super::detector::{self, DesiredPrimaryWriter, DetectorSettings, DetectorState, PrimaryHealth};
use super::events::EventRecorder;
use super::sql::{NodeAddress, SqlControl};
use super::status::{update_status, StatusStore, VersionedStatus};
use super::switchover::{self, SwitchoverContext, SwitchoverRequest, SwitchoverSettings};
use super::topology::{node_addresses, ClusterTopology};
use super::traffic::TrafficCoordinator;

const BIND_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-cluster timing taken from the spec
#[derive(Clone, Copy, Debug)]
pub struct PassSettings {
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub switchover_timeout: Duration,
    pub detector: DetectorSettings,
    pub switchover: SwitchoverSettings,
}

impl PassSettings {
    pub fn from_cluster(cluster: &MariaDbCluster) -> Self {
        let replication = &cluster.spec.replication;
        let gateway_ready = cluster
            .gateway_config()
            .map(|g| g.ready_timeout_seconds)
            .unwrap_or(120);
        Self {
            probe_timeout: Duration::from_secs(replication.probe_timeout_seconds),
            probe_interval: Duration::from_secs(replication.probe_interval_seconds),
            switchover_timeout: Duration::from_secs(replication.switchover_timeout_seconds),
            detector: DetectorSettings {
                automatic_failover: replication.primary.automatic_failover,
                delay: Duration::from_secs(replication.primary.automatic_failover_delay_seconds),
            },
            switchover: SwitchoverSettings {
                sync_timeout: Duration::from_secs(replication.sync_timeout_seconds),
                poll_interval: Duration::from_secs(1),
                bind_timeout: BIND_CONFIRM_TIMEOUT,
                gateway_ready_timeout: Duration::from_secs(gateway_ready),
                unreachable_primary_sync: replication.unreachable_primary_sync,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// No primary was recorded; the desired one was adopted as-is
    Adopted { primary: i32 },
    /// Observed matches desired; carries the detector's verdict
    Routine { health: PrimaryHealth },
    /// A switchover committed
    SwitchedOver { primary: i32, warnings: Vec<String> },
    /// The attempt series ran past its bound and was parked
    NeedsManualIntervention { target: i32 },
    Suspended,
}

impl PassOutcome {
    /// When the next pass should run
    pub fn requeue_after(&self, probe_interval: Duration) -> Duration {
        match self {
            PassOutcome::Routine {
                health: PrimaryHealth::FailoverRequested { .. },
            } => Duration::from_secs(1),
            PassOutcome::Adopted { .. }
            | PassOutcome::Routine { .. }
            | PassOutcome::SwitchedOver { .. } => probe_interval,
            PassOutcome::NeedsManualIntervention { .. } | PassOutcome::Suspended => {
                Duration::from_secs(60)
            }
        }
    }
}

/// Collaborators and inputs for one pass
pub struct ClusterPass {
    pub cluster: MariaDbCluster,
    pub settings: PassSettings,
    pub sql: Arc<dyn SqlControl>,
    pub traffic: Arc<dyn TrafficCoordinator>,
    pub status: Arc<dyn StatusStore>,
    pub desired: Arc<dyn DesiredPrimaryWriter>,
    pub events: Arc<dyn EventRecorder>,
    pub cancel: CancellationToken,
    pub now: DateTime<Utc>,
}

impl ClusterPass {
    fn address(&self, index: i32) -> NodeAddress {
        NodeAddress::for_pod(&self.cluster, index)
    }

    async fn observe(&self, primary_index: i32) -> ClusterTopology {
        ClusterTopology::observe(
            self.sql.as_ref(),
            node_addresses(&self.cluster),
            primary_index,
            self.settings.probe_timeout,
        )
        .await
    }

    #[instrument(skip(self), fields(name = %self.cluster.name_any(), namespace = self.cluster.namespace()))]
    pub async fn run(&self) -> Result<PassOutcome> {
        let versioned = self.status.fetch().await?;
        if self.cluster.spec.suspended {
            debug!("Cluster suspended, skipping pass");
            return Ok(PassOutcome::Suspended);
        }

        let desired = versioned.desired_primary_index;
        if desired < 0 || desired >= self.cluster.spec.replicas {
            return Err(Error::ValidationError(format!(
                "desired primary {} outside 0..{}",
                desired, self.cluster.spec.replicas
            )));
        }

        match versioned.status.current_primary_index {
            None => self.adopt(desired).await,
            Some(observed) if observed == desired => self.routine(&versioned, observed).await,
            Some(observed) => self.switch(&versioned, observed, desired).await,
        }
    }

    async fn adopt(&self, desired: i32) -> Result<PassOutcome> {
        let primary = self.address(desired);
        info!("No primary recorded, adopting {}", primary.name);

        self.traffic.ensure_primary_service().await?;
        self.traffic.rebind_primary(&primary).await?;

        let generation = self.cluster.metadata.generation;
        update_status(self.status.as_ref(), |s| {
            s.current_primary_index = Some(desired);
            s.current_primary = Some(primary.name.clone());
            s.observed_generation = generation;
            s.message = Some(format!("{} adopted as primary", primary.name));
            set_condition(
                &mut s.conditions,
                CONDITION_TYPE_READY,
                CONDITION_STATUS_TRUE,
                "PrimaryAdopted",
                &format!("{} is the primary", primary.name),
            );
        })
        .await?;
        self.events
            .normal("PrimaryAdopted", &format!("{} is the primary", primary.name))
            .await;
        Ok(PassOutcome::Adopted { primary: desired })
    }

    async fn routine(&self, versioned: &VersionedStatus, observed: i32) -> Result<PassOutcome> {
        let topology = self.observe(observed).await;
        let prev = DetectorState::from_status(&versioned.status);
        let tick = detector::evaluate(
            self.desired.as_ref(),
            self.settings.detector,
            versioned.resource_version.as_deref(),
            &prev,
            &topology,
            self.now,
        )
        .await?;

        let primary = self.address(observed);
        let (ready, reason, message) = match &tick.health {
            PrimaryHealth::Healthy => (true, "PrimaryHealthy", format!("{} is serving", primary.name)),
            PrimaryHealth::Suspect => (false, "PrimarySuspect", format!("{} missed a probe", primary.name)),
            PrimaryHealth::FailingSince(since) => (
                false,
                "PrimaryFailing",
                format!("{} failing since {}", primary.name, since.to_rfc3339()),
            ),
            PrimaryHealth::FailoverRequested { candidate, .. } => (
                false,
                "FailoverRequested",
                format!("{} failing, failover to ordinal {} requested", primary.name, candidate),
            ),
        };
        let generation = self.cluster.metadata.generation;
        let state = tick.state.clone();
        update_status(self.status.as_ref(), |s| {
            state.apply_to(s);
            s.observed_generation = generation;
            // observed == desired, so no attempt series is pending
            s.switchover = None;
            set_condition(
                &mut s.conditions,
                CONDITION_TYPE_READY,
                if ready { CONDITION_STATUS_TRUE } else { CONDITION_STATUS_FALSE },
                reason,
                &message,
            );
            if find_condition(&s.conditions, CONDITION_TYPE_NEEDS_MANUAL_INTERVENTION).is_some() {
                set_condition(
                    &mut s.conditions,
                    CONDITION_TYPE_NEEDS_MANUAL_INTERVENTION,
                    CONDITION_STATUS_FALSE,
                    "Resolved",
                    "observed and desired primary agree",
                );
            }
            if ready && find_condition(&s.conditions, CONDITION_TYPE_DEGRADED).is_some() {
                set_condition(
                    &mut s.conditions,
                    CONDITION_TYPE_DEGRADED,
                    CONDITION_STATUS_FALSE,
                    "NoIssues",
                    "No degradation detected",
                );
            }
        })
        .await?;

        #[cfg(feature = "metrics")]
        super::metrics::set_primary_failing(
            &self.cluster.namespace().unwrap_or_default(),
            &self.cluster.name_any(),
            !ready,
        );

        if let PrimaryHealth::FailoverRequested { candidate, .. } = &tick.health {
            self.events
                .warning(
                    "FailoverRequested",
                    &format!(
                        "{} unreachable, promoting {}",
                        primary.name,
                        self.cluster.pod_name(*candidate)
                    ),
                )
                .await;
        }

        if tick.health == PrimaryHealth::Healthy {
            self.ensure_binding(&primary).await;
            self.heal(&topology, &primary).await;
        }
        Ok(PassOutcome::Routine { health: tick.health })
    }

    /// Keep the stable endpoint on the primary; traffic converges on later passes
    async fn ensure_binding(&self, primary: &NodeAddress) {
        let result = async {
            self.traffic.ensure_primary_service().await?;
            if self.traffic.current_binding().await?.as_deref() != Some(primary.name.as_str()) {
                info!("Primary endpoint drifted, rebinding to {}", primary.name);
                self.traffic.rebind_primary(primary).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to converge primary endpoint: {}", e);
        }
    }

    /// Make the primary writable and point every reachable replica at it
    async fn heal(&self, topology: &ClusterTopology, primary: &NodeAddress) {
        match self.sql.is_read_only(primary).await {
            Ok(true) => {
                info!("Primary {} is read-only, enabling writes", primary.name);
                match self.sql.set_read_only(primary, false).await {
                    Ok(()) => {
                        self.events
                            .normal("PrimaryWritable", &format!("{} accepts writes", primary.name))
                            .await
                    }
                    Err(e) => warn!("Failed to enable writes on {}: {}", primary.name, e),
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to read read_only on {}: {}", primary.name, e),
        }

        for node in topology.replicas().filter(|n| n.reachable) {
            let source = match self.sql.replication_source(&node.address).await {
                Ok(source) => source,
                Err(e) => {
                    warn!("Failed to read replication status of {}: {}", node.name(), e);
                    continue;
                }
            };
            if source.as_deref() == Some(primary.host.as_str()) {
                continue;
            }
            info!(
                "{} replicates from {:?}, reattaching to {}",
                node.name(),
                source,
                primary.name
            );
            match self
                .sql
                .reconfigure_as_replica_of(&node.address, primary)
                .await
            {
                Ok(()) => {
                    self.events
                        .normal(
                            "ReplicaReattached",
                            &format!("{} now replicates from {}", node.name(), primary.name),
                        )
                        .await
                }
                Err(e) => warn!("Failed to reattach {}: {}", node.name(), e),
            }
        }
    }

    async fn switch(
        &self,
        versioned: &VersionedStatus,
        observed: i32,
        desired: i32,
    ) -> Result<PassOutcome> {
        if let Some(series) = versioned
            .status
            .switchover
            .as_ref()
            .filter(|s| s.target_index == desired)
        {
            let started = DateTime::parse_from_rfc3339(&series.started_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(self.now);
            let elapsed = (self.now - started).to_std().unwrap_or(Duration::ZERO);
            if elapsed > self.settings.switchover_timeout {
                return self.park(versioned, series, elapsed).await;
            }
        }

        let topology = self.observe(observed).await;
        let old = self.address(observed);
        let candidate = self.address(desired);
        let old_reachable = topology.is_reachable(observed);
        let trigger = if versioned.status.current_primary_failing_since.is_some() || !old_reachable
        {
            SwitchoverTrigger::Unplanned
        } else {
            SwitchoverTrigger::Planned
        };

        let now = self.now.to_rfc3339();
        update_status(self.status.as_ref(), |s| {
            let series = match s.switchover.take() {
                Some(series) if series.target_index == desired => series,
                _ => SwitchoverStatus {
                    old_index: observed,
                    target_index: desired,
                    trigger,
                    started_at: now.clone(),
                    attempts: 0,
                    last_error: None,
                },
            };
            s.switchover = Some(SwitchoverStatus {
                attempts: series.attempts + 1,
                ..series
            });
            set_condition(
                &mut s.conditions,
                CONDITION_TYPE_NEEDS_MANUAL_INTERVENTION,
                CONDITION_STATUS_FALSE,
                "SwitchoverInProgress",
                &format!("switching primary to ordinal {}", desired),
            );
        })
        .await?;

        if !topology.is_reachable(desired) {
            let err = Error::Unreachable {
                node: candidate.name.clone(),
                reason: "switchover candidate did not answer its probe".to_string(),
            };
            self.record_failure(&err).await;
            return Err(err);
        }

        let request = SwitchoverRequest::new(old.clone(), candidate.clone(), trigger, old_reachable)?;
        self.events
            .normal(
                "SwitchoverStarted",
                &format!("{} switchover {} -> {}", trigger, old.name, candidate.name),
            )
            .await;

        let ctx = SwitchoverContext::new(
            self.cluster.namespace().unwrap_or_else(|| "default".to_string()),
            self.cluster.name_any(),
            request,
            topology,
            self.settings.switchover,
            self.sql.clone(),
            self.traffic.clone(),
            self.status.clone(),
            self.events.clone(),
            self.cancel.clone(),
        );

        let result = switchover::execute(&ctx).await;

        #[cfg(feature = "metrics")]
        super::metrics::record_switchover(
            &ctx.namespace,
            &ctx.name,
            &trigger.to_string(),
            if result.is_ok() { "success" } else { "failure" },
        );

        match result {
            Ok(report) => Ok(PassOutcome::SwitchedOver {
                primary: desired,
                warnings: report.warnings(),
            }),
            Err(e) => {
                self.record_failure(&e).await;
                Err(e)
            }
        }
    }

    async fn record_failure(&self, err: &Error) {
        let message = err.to_string();
        if let Err(e) = update_status(self.status.as_ref(), |s| {
            if let Some(series) = s.switchover.as_mut() {
                series.last_error = Some(message.clone());
            }
            s.message = Some(message.clone());
        })
        .await
        {
            warn!("Failed to record switchover error: {}", e);
        }
    }

    /// Stop retrying a series that exceeded its bound
    async fn park(
        &self,
        versioned: &VersionedStatus,
        series: &SwitchoverStatus,
        elapsed: Duration,
    ) -> Result<PassOutcome> {
        let target = series.target_index;
        let message = format!(
            "switchover to ordinal {} has not completed after {} attempts in {}s: {}",
            target,
            series.attempts,
            elapsed.as_secs(),
            series.last_error.as_deref().unwrap_or("no error recorded")
        );
        let already_parked = is_condition_true(
            &versioned.status.conditions,
            CONDITION_TYPE_NEEDS_MANUAL_INTERVENTION,
        );

        update_status(self.status.as_ref(), |s| {
            s.message = Some(message.clone());
            set_condition(
                &mut s.conditions,
                CONDITION_TYPE_NEEDS_MANUAL_INTERVENTION,
                CONDITION_STATUS_TRUE,
                "SwitchoverTimedOut",
                &message,
            );
            set_condition(
                &mut s.conditions,
                CONDITION_TYPE_DEGRADED,
                CONDITION_STATUS_TRUE,
                "SwitchoverTimedOut",
                &message,
            );
        })
        .await?;

        if !already_parked {
            warn!("{}", message);
            self.events.warning("NeedsManualIntervention", &message).await;
        }
        Ok(PassOutcome::NeedsManualIntervention { target })
    }
}
