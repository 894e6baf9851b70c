//! Primary failure detection
//!
//! The detector walks `Healthy -> Suspect -> FailingSince(t) -> FailoverRequested`
//! one probe result at a time. Its state lives in the cluster status
//! (`primaryProbeFailures`, `currentPrimaryFailingSince`) so a restarted
//! operator resumes the debounce where it left off.
//!
//! The only side effect is writing a new desired primary index. The detector
//! never issues SQL or touches traffic.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::crd::MariaDbClusterStatus;
use crate::error::{Error, Result};

use super::selector::{select_candidate, ReplicaPosition};
use super::topology::ClusterTopology;

/// Sink for the detector's single mutation
#[async_trait]
pub trait DesiredPrimaryWriter: Send + Sync {
    /// Set the desired primary ordinal, conditional on `expected_version`
    async fn set_desired_primary(&self, expected_version: Option<&str>, index: i32) -> Result<()>;
}

/// Persisted debounce state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetectorState {
    pub consecutive_failures: u32,
    pub failing_since: Option<DateTime<Utc>>,
}

impl DetectorState {
    pub fn from_status(status: &MariaDbClusterStatus) -> Self {
        let failing_since = status
            .current_primary_failing_since
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        Self {
            consecutive_failures: status.primary_probe_failures,
            failing_since,
        }
    }

    pub fn apply_to(&self, status: &mut MariaDbClusterStatus) {
        status.primary_probe_failures = self.consecutive_failures;
        status.current_primary_failing_since = self.failing_since.map(|t| t.to_rfc3339());
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrimaryHealth {
    Healthy,
    Suspect,
    FailingSince(DateTime<Utc>),
    FailoverRequested {
        since: DateTime<Utc>,
        candidate: i32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectorTick {
    pub state: DetectorState,
    pub health: PrimaryHealth,
}

/// Advance the detector by one probe result
pub fn tick(
    prev: &DetectorState,
    primary_reachable: bool,
    replicas: &[ReplicaPosition],
    delay: Duration,
    now: DateTime<Utc>,
) -> DetectorTick {
    if primary_reachable {
        return DetectorTick {
            state: DetectorState::default(),
            health: PrimaryHealth::Healthy,
        };
    }

    let since = prev.failing_since.unwrap_or(now);
    let state = DetectorState {
        consecutive_failures: prev.consecutive_failures.saturating_add(1),
        failing_since: Some(since),
    };

    if state.consecutive_failures < 2 {
        return DetectorTick {
            state,
            health: PrimaryHealth::Suspect,
        };
    }

    // escalate only once the outage is strictly longer than the delay
    let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
    if elapsed <= delay {
        return DetectorTick {
            state,
            health: PrimaryHealth::FailingSince(since),
        };
    }

    let health = match select_candidate(replicas) {
        Ok(candidate) => PrimaryHealth::FailoverRequested { since, candidate },
        Err(_) => PrimaryHealth::FailingSince(since),
    };
    DetectorTick { state, health }
}

#[derive(Clone, Copy, Debug)]
pub struct DetectorSettings {
    pub automatic_failover: bool,
    pub delay: Duration,
}

/// Run one detector tick and, if it asks for failover, write the new desired primary.
///
/// `expected_version` guards the desired-state write against concurrent edits.
/// The returned state still has to be persisted by the caller.
pub async fn evaluate(
    writer: &dyn DesiredPrimaryWriter,
    settings: DetectorSettings,
    expected_version: Option<&str>,
    prev: &DetectorState,
    topology: &ClusterTopology,
    now: DateTime<Utc>,
) -> Result<DetectorTick> {
    let primary_reachable = topology.primary().map(|p| p.reachable).unwrap_or(false);
    let replicas = topology.replica_positions();
    let mut result = tick(prev, primary_reachable, &replicas, settings.delay, now);

    match result.health {
        PrimaryHealth::FailoverRequested { since, candidate } => {
            if !settings.automatic_failover {
                warn!(
                    "Primary failing since {} but automatic failover is disabled",
                    since
                );
                result.health = PrimaryHealth::FailingSince(since);
                return Ok(result);
            }
            info!(
                "Primary failing since {}, requesting failover to ordinal {}",
                since, candidate
            );
            writer.set_desired_primary(expected_version, candidate).await?;
        }
        PrimaryHealth::FailingSince(since) if replicas.is_empty() => {
            warn!(
                "Primary failing since {} and no replica is eligible: {}",
                since,
                Error::NoEligibleCandidate
            );
        }
        _ => {}
    }
    Ok(result)
}
