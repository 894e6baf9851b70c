//! Switchover orchestration
//!
//! A switchover is a fixed, ordered list of named phases (see
//! [`SWITCHOVER_PHASES`]) run one after another by [`execute`]. Every phase
//! checks its postcondition before acting, so an attempt that dies midway can
//! be re-run from the start by the next reconciliation pass. The observed
//! primary index changes only in the final phase.

mod phases;
mod request;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::crd::UnreachablePrimarySync;
use crate::error::{Error, Result};

use super::events::EventRecorder;
use super::gtid::GtidPosition;
use super::sql::SqlControl;
use super::status::{update_status, StatusStore};
use super::topology::ClusterTopology;
use super::traffic::TrafficCoordinator;

pub use phases::{Gate, Phase, PhaseName, PhasePolicy, SWITCHOVER_PHASES};
pub use request::SwitchoverRequest;

#[derive(Clone, Copy, Debug)]
pub struct SwitchoverSettings {
    /// Bound on the candidate catching up with the old primary
    pub sync_timeout: Duration,
    /// Interval for every polling wait inside the attempt
    pub poll_interval: Duration,
    /// Bound on the traffic binding read-back
    pub bind_timeout: Duration,
    /// Bound on the gateway coming back after a restart
    pub gateway_ready_timeout: Duration,
    pub unreachable_primary_sync: UnreachablePrimarySync,
}

/// Everything one attempt needs, owned for the attempt's duration
pub struct SwitchoverContext {
    pub namespace: String,
    pub name: String,
    pub request: SwitchoverRequest,
    pub topology: ClusterTopology,
    pub settings: SwitchoverSettings,
    pub sql: Arc<dyn SqlControl>,
    pub traffic: Arc<dyn TrafficCoordinator>,
    pub status: Arc<dyn StatusStore>,
    pub events: Arc<dyn EventRecorder>,
    pub cancel: CancellationToken,
    /// Never cancelled; handed to waits once the candidate is promoted
    committing: CancellationToken,
    sync_target: Mutex<Option<GtidPosition>>,
    old_primary_lost: AtomicBool,
    promoted: AtomicBool,
}

impl SwitchoverContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        request: SwitchoverRequest,
        topology: ClusterTopology,
        settings: SwitchoverSettings,
        sql: Arc<dyn SqlControl>,
        traffic: Arc<dyn TrafficCoordinator>,
        status: Arc<dyn StatusStore>,
        events: Arc<dyn EventRecorder>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            request,
            topology,
            settings,
            sql,
            traffic,
            status,
            events,
            cancel,
            committing: CancellationToken::new(),
            sync_target: Mutex::new(None),
            old_primary_lost: AtomicBool::new(false),
            promoted: AtomicBool::new(false),
        }
    }

    /// Whether primary-local SQL may still be issued against the old primary
    pub fn old_primary_available(&self) -> bool {
        self.request.old_primary_reachable() && !self.old_primary_lost.load(Ordering::SeqCst)
    }

    fn mark_old_primary_lost(&self) {
        self.old_primary_lost.store(true, Ordering::SeqCst);
    }

    /// Whether the candidate was promoted during this attempt
    pub fn promoted(&self) -> bool {
        self.promoted.load(Ordering::SeqCst)
    }

    fn mark_promoted(&self) {
        self.promoted.store(true, Ordering::SeqCst);
    }

    /// Token for waits inside a phase.
    ///
    /// After promotion the attempt must reach the commit, so cancellation of
    /// the pass no longer applies.
    pub fn cancel_token(&self) -> &CancellationToken {
        if self.promoted() {
            &self.committing
        } else {
            &self.cancel
        }
    }

    fn sync_target(&self) -> Option<GtidPosition> {
        self.sync_target.lock().ok().and_then(|t| t.clone())
    }

    fn set_sync_target(&self, target: GtidPosition) {
        if let Ok(mut slot) = self.sync_target.lock() {
            *slot = Some(target);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The phase acted and its postcondition now holds
    Completed,
    /// The postcondition already held; nothing was done
    AlreadySatisfied,
    /// The phase was deliberately not run
    Skipped(String),
    /// The phase failed under a warn-only policy
    Failed(String),
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Completed => write!(f, "completed"),
            PhaseOutcome::AlreadySatisfied => write!(f, "already satisfied"),
            PhaseOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            PhaseOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-phase outcomes of a finished attempt, in execution order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwitchoverReport {
    pub outcomes: Vec<(PhaseName, PhaseOutcome)>,
}

impl SwitchoverReport {
    pub fn outcome(&self, phase: PhaseName) -> Option<&PhaseOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| *name == phase)
            .map(|(_, outcome)| outcome)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                PhaseOutcome::Failed(reason) => Some(format!("{}: {}", name, reason)),
                _ => None,
            })
            .collect()
    }
}

/// Run every phase in order.
///
/// An abort-policy failure stops the attempt with `Error::PhaseFailed` and no
/// observed-primary change. Cancellation stops it with `Error::Cancelled`
/// whatever the phase's policy, but only until the candidate is promoted;
/// from then on the remaining phases run through to the commit.
#[instrument(skip(ctx), fields(
    name = %ctx.name,
    namespace = %ctx.namespace,
    old = %ctx.request.old_primary().name,
    candidate = %ctx.request.candidate().name,
))]
pub async fn execute(ctx: &SwitchoverContext) -> Result<SwitchoverReport> {
    let mut report = SwitchoverReport::default();
    info!(
        "Starting {} switchover ({} -> {})",
        ctx.request.trigger(),
        ctx.request.old_primary().name,
        ctx.request.candidate().name
    );

    for phase in SWITCHOVER_PHASES {
        if ctx.cancel.is_cancelled() {
            if !ctx.promoted() {
                return Err(Error::Cancelled);
            }
            debug!("Pass cancelled after promotion, finishing {}", phase.name);
        }

        let started = Instant::now();
        let outcome = if !phase.gate.allows(ctx) {
            let reason = format!("old primary {} unreachable", ctx.request.old_primary().name);
            warn!("Skipping {}: {}", phase.name, reason);
            PhaseOutcome::Skipped(reason)
        } else {
            match (phase.run)(ctx).await {
                Ok(outcome) => outcome,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if phase.gate == Gate::OldPrimaryReachable && e.is_unreachable() => {
                    warn!("Old primary lost during {}: {}", phase.name, e);
                    ctx.mark_old_primary_lost();
                    ctx.events
                        .warning(
                            "OldPrimaryUnreachable",
                            &format!("{} skipped: {}", phase.name, e),
                        )
                        .await;
                    PhaseOutcome::Skipped(e.to_string())
                }
                Err(e) => match phase.on_error {
                    PhasePolicy::Abort => {
                        warn!("Switchover aborted in {}: {}", phase.name, e);
                        ctx.events
                            .warning(
                                "SwitchoverAborted",
                                &format!("{} failed: {}", phase.name, e),
                            )
                            .await;
                        #[cfg(feature = "metrics")]
                        super::metrics::observe_phase_duration(
                            phase.name.as_str(),
                            started.elapsed().as_secs_f64(),
                        );
                        return Err(Error::PhaseFailed {
                            phase: phase.name.to_string(),
                            source: Box::new(e),
                        });
                    }
                    PhasePolicy::Warn => {
                        warn!("{} failed, continuing: {}", phase.name, e);
                        ctx.events
                            .warning("SwitchoverPhaseFailed", &format!("{}: {}", phase.name, e))
                            .await;
                        PhaseOutcome::Failed(e.to_string())
                    }
                },
            }
        };

        #[cfg(feature = "metrics")]
        super::metrics::observe_phase_duration(
            phase.name.as_str(),
            started.elapsed().as_secs_f64(),
        );
        info!(
            "{} {} in {:?}",
            phase.name,
            outcome,
            started.elapsed()
        );
        report.outcomes.push((phase.name, outcome));

        if phase.name != PhaseName::CommitStatus {
            record_progress(ctx, phase.name).await;
        }
    }

    ctx.events
        .normal(
            "SwitchoverCompleted",
            &format!(
                "{} is the primary (was {})",
                ctx.request.candidate().name,
                ctx.request.old_primary().name
            ),
        )
        .await;
    Ok(report)
}

/// Record the last finished phase; losing this write does not fail the attempt
async fn record_progress(ctx: &SwitchoverContext, phase: PhaseName) {
    let name = phase.to_string();
    if let Err(e) = update_status(ctx.status.as_ref(), |s| {
        s.last_switchover_phase = Some(name.clone())
    })
    .await
    {
        warn!("Failed to record switchover progress {}: {}", phase, e);
    }
}
