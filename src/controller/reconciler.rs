//! Main reconciler for MariaDbCluster resources
//!
//! Wires the kube-rs runtime `Controller` to [`ClusterPass`]. Every pass gets
//! fresh collaborators built from the cluster object and a cancellation token
//! scoped to the current lease term, which shutdown and lease loss both cancel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::MariaDbCluster;
use crate::error::{Error, Result};

use super::backoff::{calculate_backoff, with_jitter};
use super::conditions::{set_condition, CONDITION_STATUS_FALSE, CONDITION_TYPE_READY};
use super::driver::{ClusterPass, PassOutcome, PassSettings};
use super::events::{EventRecorder, KubeEventRecorder};
use super::sql::MariaDbSql;
use super::status::{update_status, KubeStatusStore};
use super::traffic::KubeTrafficCoordinator;

const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(10);
const SUPERSEDE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub operator_namespace: String,
    /// Restrict the watch to one namespace; `None` watches all of them
    pub watch_namespace: Option<String>,
    pub is_leader: Arc<AtomicBool>,
    /// Cancelled on operator shutdown
    pub shutdown: CancellationToken,
    /// Child of `shutdown` for the current lease term; every pass runs under
    /// a child of it
    leadership: Mutex<CancellationToken>,
    failures: Mutex<HashMap<String, u32>>,
}

impl ControllerState {
    pub fn new(
        client: Client,
        operator_namespace: impl Into<String>,
        watch_namespace: Option<String>,
        is_leader: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Self {
        let leadership = shutdown.child_token();
        if !is_leader.load(Ordering::SeqCst) {
            leadership.cancel();
        }
        Self {
            client,
            operator_namespace: operator_namespace.into(),
            watch_namespace,
            is_leader,
            shutdown,
            leadership: Mutex::new(leadership),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record the result of a leader election round.
    ///
    /// Losing the lease cancels every pass started during the term; gaining it
    /// opens a new term. Returns whether leadership changed.
    pub fn set_leader(&self, leader: bool) -> bool {
        let mut term = match self.leadership.lock() {
            Ok(term) => term,
            Err(poisoned) => poisoned.into_inner(),
        };
        let was_leader = self.is_leader.load(Ordering::SeqCst);
        if leader && !was_leader {
            *term = self.shutdown.child_token();
            self.is_leader.store(true, Ordering::SeqCst);
        } else if !leader && was_leader {
            self.is_leader.store(false, Ordering::SeqCst);
            term.cancel();
        }
        leader != was_leader
    }

    /// Cancellation token for one pass
    pub fn pass_token(&self) -> CancellationToken {
        match self.leadership.lock() {
            Ok(term) => term.child_token(),
            Err(poisoned) => poisoned.into_inner().child_token(),
        }
    }

    fn clusters(&self) -> Api<MariaDbCluster> {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Count one more consecutive failure for `key` and return the new count
    fn record_failure(&self, key: &str) -> u32 {
        match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.to_string()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
            Err(_) => 1,
        }
    }

    fn reset_failures(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }
}

fn object_key(cluster: &MariaDbCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let clusters = state.clusters();

    info!(
        "Starting MariaDbCluster controller (watch namespace: {})",
        state.watch_namespace.as_deref().unwrap_or("<all>")
    );

    // Verify CRD exists
    match clusters.list(&Default::default()).await {
        Ok(_) => info!("MariaDbCluster CRD is available"),
        Err(e) => {
            error!(
                "MariaDbCluster CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "MariaDbCluster CRD not installed".to_string(),
            ));
        }
    }

    let services: Api<Service> = match &state.watch_namespace {
        Some(ns) => Api::namespaced(state.client.clone(), ns),
        None => Api::all(state.client.clone()),
    };

    Controller::new(clusters, Config::default())
        // The primary Service is owned by its cluster
        .owns::<Service>(services, Config::default())
        .graceful_shutdown_on(state.shutdown.clone().cancelled_owned())
        .run(reconcile, error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    // stops the REST server if the controller stream ended on its own
    state.shutdown.cancel();
    Ok(())
}

/// Cancel `shutdown` on SIGTERM or Ctrl-C
pub async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - A MariaDbCluster is created or updated
/// - The owned primary Service changes
/// - The requeue timer expires
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<MariaDbCluster>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping reconcile");
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let result = reconcile_cluster(&ctx, &obj).await;

    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(started.elapsed().as_secs_f64());

    let outcome = result?;
    ctx.reset_failures(&object_key(&obj));

    let settings = PassSettings::from_cluster(&obj);
    let requeue = outcome.requeue_after(settings.probe_interval);
    debug!("Pass finished with {:?}, requeue in {:?}", outcome, requeue);
    Ok(Action::requeue(requeue))
}

async fn reconcile_cluster(ctx: &ControllerState, cluster: &MariaDbCluster) -> Result<PassOutcome> {
    let client = ctx.client.clone();
    let store = Arc::new(KubeStatusStore::new(&client, cluster));
    let events = Arc::new(KubeEventRecorder::new(client.clone(), cluster));

    if let Err(errors) = cluster.spec.validate() {
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        warn!("Validation failed for {}: {}", cluster.name_any(), message);
        update_status(store.as_ref(), |s| {
            s.message = Some(message.clone());
            set_condition(
                &mut s.conditions,
                CONDITION_TYPE_READY,
                CONDITION_STATUS_FALSE,
                "InvalidSpec",
                &message,
            );
        })
        .await?;
        events.warning("InvalidSpec", &message).await;
        return Err(Error::ValidationError(message));
    }

    let sql = Arc::new(MariaDbSql::from_cluster(&client, cluster).await?);
    let traffic = Arc::new(KubeTrafficCoordinator::new(client.clone(), cluster)?);
    let cancel = ctx.pass_token();

    let switching = cluster
        .observed_primary_index()
        .is_some_and(|observed| observed != cluster.desired_primary_index());
    if switching {
        let api: Api<MariaDbCluster> = Api::namespaced(
            client.clone(),
            &cluster.namespace().unwrap_or_else(|| "default".to_string()),
        );
        tokio::spawn(cancel_on_supersede(
            api,
            cluster.name_any(),
            cluster.desired_primary_index(),
            cancel.clone(),
        ));
    }

    let pass = ClusterPass {
        cluster: cluster.clone(),
        settings: PassSettings::from_cluster(cluster),
        sql,
        traffic,
        status: store.clone(),
        desired: store,
        events,
        cancel: cancel.clone(),
        now: Utc::now(),
    };
    let result = pass.run().await;

    // stops the supersede watcher
    cancel.cancel();
    result
}

/// Cancel `cancel` once the desired primary moves away from `target`
async fn cancel_on_supersede(
    api: Api<MariaDbCluster>,
    name: String,
    target: i32,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(SUPERSEDE_POLL_INTERVAL) => {}
        }
        match api.get(&name).await {
            Ok(current) if current.desired_primary_index() != target => {
                info!(
                    "Desired primary of {} changed from {} to {}, cancelling the running attempt",
                    name,
                    target,
                    current.desired_primary_index()
                );
                cancel.cancel();
                return;
            }
            Ok(_) => {}
            Err(e) => debug!("Supersede check for {} failed: {}", name, e),
        }
    }
}

/// Error policy for the controller
fn error_policy(obj: Arc<MariaDbCluster>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(error.kind());

    let key = object_key(&obj);
    if matches!(error, Error::Cancelled) {
        info!("Pass for {} was cancelled, re-running", key);
        return Action::requeue(Duration::from_secs(1));
    }
    if !error.is_retriable() {
        error!("Reconciliation of {} failed permanently: {:?}", key, error);
        return Action::requeue(Duration::from_secs(60));
    }

    let attempt = ctx.record_failure(&key);
    let delay = with_jitter(calculate_backoff(attempt - 1, None, None), 0.2);
    warn!(
        "Reconciliation of {} failed (attempt {}), retrying in {:?}: {}",
        key, attempt, delay, error
    );
    Action::requeue(delay)
}
