use std::fmt;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::crd::UnreachablePrimarySync;
use crate::error::{Error, Result};

use super::super::conditions::{
    find_condition, set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_TYPE_DEGRADED, CONDITION_TYPE_NEEDS_MANUAL_INTERVENTION,
    CONDITION_TYPE_PRIMARY_SWITCHED,
};
use super::super::status::update_status;
use super::super::wait::poll_until_success_or_cancelled;
use super::{PhaseOutcome, SwitchoverContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseName {
    LockOldPrimary,
    SetOldPrimaryReadOnly,
    BeginTrafficDrain,
    WaitForReplicaSync,
    PromoteCandidate,
    ReattachReplicas,
    TerminateStaleConnections,
    RedirectTrafficBinding,
    DemoteOldPrimary,
    CommitStatus,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::LockOldPrimary => "LockOldPrimary",
            PhaseName::SetOldPrimaryReadOnly => "SetOldPrimaryReadOnly",
            PhaseName::BeginTrafficDrain => "BeginTrafficDrain",
            PhaseName::WaitForReplicaSync => "WaitForReplicaSync",
            PhaseName::PromoteCandidate => "PromoteCandidate",
            PhaseName::ReattachReplicas => "ReattachReplicas",
            PhaseName::TerminateStaleConnections => "TerminateStaleConnections",
            PhaseName::RedirectTrafficBinding => "RedirectTrafficBinding",
            PhaseName::DemoteOldPrimary => "DemoteOldPrimary",
            PhaseName::CommitStatus => "CommitStatus",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precondition for running a phase at all
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    Always,
    /// Only while SQL can be issued against the old primary
    OldPrimaryReachable,
}

impl Gate {
    pub fn allows(&self, ctx: &SwitchoverContext) -> bool {
        match self {
            Gate::Always => true,
            Gate::OldPrimaryReachable => ctx.old_primary_available(),
        }
    }
}

/// What a phase error does to the attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhasePolicy {
    /// Stop the attempt; nothing is committed
    Abort,
    /// Record a warning and continue
    Warn,
}

pub type PhaseFn = for<'a> fn(&'a SwitchoverContext) -> BoxFuture<'a, Result<PhaseOutcome>>;

pub struct Phase {
    pub name: PhaseName,
    pub gate: Gate,
    pub on_error: PhasePolicy,
    pub run: PhaseFn,
}

/// Execution order of a switchover. Promotion precedes connection termination.
pub const SWITCHOVER_PHASES: &[Phase] = &[
    Phase {
        name: PhaseName::LockOldPrimary,
        gate: Gate::OldPrimaryReachable,
        on_error: PhasePolicy::Abort,
        run: lock_old_primary,
    },
    Phase {
        name: PhaseName::SetOldPrimaryReadOnly,
        gate: Gate::OldPrimaryReachable,
        on_error: PhasePolicy::Abort,
        run: set_old_primary_read_only,
    },
    Phase {
        name: PhaseName::BeginTrafficDrain,
        gate: Gate::Always,
        on_error: PhasePolicy::Warn,
        run: begin_traffic_drain,
    },
    Phase {
        name: PhaseName::WaitForReplicaSync,
        gate: Gate::Always,
        on_error: PhasePolicy::Abort,
        run: wait_for_replica_sync,
    },
    Phase {
        name: PhaseName::PromoteCandidate,
        gate: Gate::Always,
        on_error: PhasePolicy::Abort,
        run: promote_candidate,
    },
    Phase {
        name: PhaseName::ReattachReplicas,
        gate: Gate::Always,
        on_error: PhasePolicy::Abort,
        run: reattach_replicas,
    },
    Phase {
        name: PhaseName::TerminateStaleConnections,
        gate: Gate::Always,
        on_error: PhasePolicy::Warn,
        run: terminate_stale_connections,
    },
    Phase {
        name: PhaseName::RedirectTrafficBinding,
        gate: Gate::Always,
        on_error: PhasePolicy::Warn,
        run: redirect_traffic_binding,
    },
    Phase {
        name: PhaseName::DemoteOldPrimary,
        gate: Gate::OldPrimaryReachable,
        on_error: PhasePolicy::Warn,
        run: demote_old_primary,
    },
    Phase {
        name: PhaseName::CommitStatus,
        gate: Gate::Always,
        on_error: PhasePolicy::Abort,
        run: commit_status,
    },
];

/// A promoted node is writable and replicates from nobody
async fn candidate_is_primary(ctx: &SwitchoverContext) -> Result<bool> {
    let candidate = ctx.request.candidate();
    if ctx.sql.is_read_only(candidate).await? {
        return Ok(false);
    }
    Ok(ctx.sql.replication_source(candidate).await?.is_none())
}

fn lock_old_primary(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        ctx.sql.acquire_read_lock(ctx.request.old_primary()).await?;
        Ok(PhaseOutcome::Completed)
    })
}

fn set_old_primary_read_only(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        let old = ctx.request.old_primary();
        ctx.sql.set_read_only(old, true).await?;
        // nothing commits on the old primary past this point
        let target = ctx.sql.gtid_position(old).await?;
        debug!("Sync target for {} is {}", ctx.request.candidate().name, target);
        ctx.set_sync_target(target);
        Ok(PhaseOutcome::Completed)
    })
}

fn begin_traffic_drain(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        ctx.traffic
            .drain_new_connections(ctx.request.old_primary())
            .await?;
        Ok(PhaseOutcome::Completed)
    })
}

fn wait_for_replica_sync(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        let candidate = ctx.request.candidate();
        if ctx.promoted() || candidate_is_primary(ctx).await? {
            return Ok(PhaseOutcome::AlreadySatisfied);
        }

        let settings = &ctx.settings;
        if ctx.old_primary_available() {
            let target = match ctx.sync_target() {
                Some(target) => target,
                None => ctx.sql.gtid_position(ctx.request.old_primary()).await?,
            };
            info!("Waiting for {} to reach {}", candidate.name, target);
            ctx.sql
                .wait_until_caught_up(
                    candidate,
                    &target,
                    settings.sync_timeout,
                    settings.poll_interval,
                    ctx.cancel_token(),
                )
                .await?;
            return Ok(PhaseOutcome::Completed);
        }

        match settings.unreachable_primary_sync {
            UnreachablePrimarySync::Skip => {
                let reason = format!(
                    "old primary {} unreachable, promoting {} without sync",
                    ctx.request.old_primary().name,
                    candidate.name
                );
                warn!("{}", reason);
                ctx.events.warning("PromotingWithoutSync", &reason).await;
                Ok(PhaseOutcome::Skipped(reason))
            }
            UnreachablePrimarySync::DrainRelayLog => {
                let Some(received) = ctx.sql.received_position(candidate).await? else {
                    return Ok(PhaseOutcome::Skipped(format!(
                        "{} reports no received position",
                        candidate.name
                    )));
                };
                info!(
                    "Old primary unreachable, draining relay log of {} up to {}",
                    candidate.name, received
                );
                ctx.sql
                    .wait_until_caught_up(
                        candidate,
                        &received,
                        settings.sync_timeout,
                        settings.poll_interval,
                        ctx.cancel_token(),
                    )
                    .await?;
                Ok(PhaseOutcome::Completed)
            }
        }
    })
}

fn promote_candidate(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        let candidate = ctx.request.candidate();
        if candidate_is_primary(ctx).await? {
            ctx.mark_promoted();
            return Ok(PhaseOutcome::AlreadySatisfied);
        }
        ctx.sql.reconfigure_as_primary(candidate).await?;
        if ctx.sql.is_read_only(candidate).await? {
            return Err(Error::Sql {
                node: candidate.name.clone(),
                source: sqlx::Error::Protocol("read_only still set after promotion".to_string()),
            });
        }
        ctx.mark_promoted();
        ctx.events
            .normal(
                "PrimaryPromoted",
                &format!("{} promoted to primary", candidate.name),
            )
            .await;
        Ok(PhaseOutcome::Completed)
    })
}

fn reattach_replicas(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        let candidate = ctx.request.candidate();
        let old = ctx.request.old_primary();
        let mut reattached = 0;
        let mut skipped = Vec::new();

        for node in ctx.topology.nodes() {
            if node.index() == candidate.index || node.index() == old.index {
                continue;
            }
            if !node.reachable {
                warn!("Replica {} unreachable, leaving it for a later pass", node.name());
                skipped.push(node.name().to_string());
                continue;
            }
            let result = async {
                if ctx.sql.replication_source(&node.address).await?.as_deref()
                    == Some(candidate.host.as_str())
                {
                    return Ok(false);
                }
                ctx.sql
                    .reconfigure_as_replica_of(&node.address, candidate)
                    .await?;
                Ok::<_, Error>(true)
            }
            .await;
            match result {
                Ok(true) => reattached += 1,
                Ok(false) => debug!("{} already replicates from {}", node.name(), candidate.name),
                Err(e) if e.is_unreachable() => {
                    warn!("Replica {} became unreachable: {}", node.name(), e);
                    skipped.push(node.name().to_string());
                }
                Err(e) => return Err(e),
            }
        }

        if !skipped.is_empty() {
            ctx.events
                .warning(
                    "ReplicaReattachSkipped",
                    &format!("unreachable replicas not reattached: {}", skipped.join(", ")),
                )
                .await;
        }
        Ok(if reattached > 0 {
            PhaseOutcome::Completed
        } else if skipped.is_empty() {
            PhaseOutcome::AlreadySatisfied
        } else {
            PhaseOutcome::Skipped(format!("unreachable: {}", skipped.join(", ")))
        })
    })
}

fn terminate_stale_connections(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        if !ctx.promoted() {
            return Err(Error::TrafficCoordinatorError(
                "refusing to terminate connections before the candidate is promoted".to_string(),
            ));
        }
        if !ctx.traffic.has_gateway() {
            return Ok(PhaseOutcome::Skipped("no gateway configured".to_string()));
        }
        ctx.traffic
            .terminate_existing_connections(ctx.request.old_primary())
            .await?;
        ctx.traffic
            .wait_ready(ctx.settings.gateway_ready_timeout, ctx.cancel_token())
            .await?;
        Ok(PhaseOutcome::Completed)
    })
}

fn redirect_traffic_binding(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        let candidate = ctx.request.candidate();
        if ctx.traffic.current_binding().await?.as_deref() == Some(candidate.name.as_str()) {
            return Ok(PhaseOutcome::AlreadySatisfied);
        }
        ctx.traffic.rebind_primary(candidate).await?;

        let traffic = ctx.traffic.as_ref();
        poll_until_success_or_cancelled(
            ctx.cancel_token(),
            ctx.settings.poll_interval,
            ctx.settings.bind_timeout,
            move || async move {
                match traffic.current_binding().await? {
                    Some(bound) if bound == candidate.name => Ok(()),
                    other => Err(Error::TrafficCoordinatorError(format!(
                        "binding resolves to {:?}, expected {}",
                        other, candidate.name
                    ))),
                }
            },
        )
        .await?;
        Ok(PhaseOutcome::Completed)
    })
}

fn demote_old_primary(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        let old = ctx.request.old_primary();
        // read_only is already set, so unlocking lets no writes through
        ctx.sql.release_read_lock(old).await?;
        ctx.sql
            .reconfigure_as_replica_of(old, ctx.request.candidate())
            .await?;
        Ok(PhaseOutcome::Completed)
    })
}

fn commit_status(ctx: &SwitchoverContext) -> BoxFuture<'_, Result<PhaseOutcome>> {
    Box::pin(async move {
        let old = ctx.request.old_primary();
        let candidate = ctx.request.candidate();
        let mut moved_elsewhere = None;

        let written = update_status(ctx.status.as_ref(), |s| {
            moved_elsewhere = None;
            match s.current_primary_index {
                Some(i) if i == candidate.index => {}
                Some(i) if i != old.index => {
                    moved_elsewhere = Some(i);
                    return;
                }
                _ => {}
            }
            s.current_primary_index = Some(candidate.index);
            s.current_primary = Some(candidate.name.clone());
            s.current_primary_failing_since = None;
            s.primary_probe_failures = 0;
            s.switchover = None;
            s.last_switchover_phase = Some(PhaseName::CommitStatus.to_string());
            s.message = Some(format!("{} promoted from {}", candidate.name, old.name));
            set_condition(
                &mut s.conditions,
                CONDITION_TYPE_PRIMARY_SWITCHED,
                CONDITION_STATUS_TRUE,
                "SwitchoverCompleted",
                &format!("{} -> {}", old.name, candidate.name),
            );
            for type_ in [CONDITION_TYPE_NEEDS_MANUAL_INTERVENTION, CONDITION_TYPE_DEGRADED] {
                if find_condition(&s.conditions, type_).is_some() {
                    set_condition(
                        &mut s.conditions,
                        type_,
                        CONDITION_STATUS_FALSE,
                        "SwitchoverCompleted",
                        "switchover committed",
                    );
                }
            }
        })
        .await?;

        if let Some(other) = moved_elsewhere {
            return Err(Error::ConcurrentModification(format!(
                "observed primary moved to {} during the switchover",
                other
            )));
        }
        debug!("Committed primary {:?}", written.current_primary_index);
        Ok(PhaseOutcome::Completed)
    })
}
