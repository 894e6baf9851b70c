//! Controller module for MariaDbCluster reconciliation
//! This module contains the controller loop, the failure detector, the
//! switchover orchestrator and the SQL and traffic clients they drive.

mod backoff;
pub mod conditions;
pub mod detector;
pub mod driver;
pub mod events;
pub mod gtid;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
pub mod selector;
pub mod sql;
pub mod status;
pub mod switchover;
pub mod topology;
pub mod traffic;
pub mod wait;

#[cfg(test)]
mod fakes;

pub use backoff::{calculate_backoff, with_jitter};
pub use detector::{DesiredPrimaryWriter, PrimaryHealth};
pub use driver::{ClusterPass, PassOutcome, PassSettings};
pub use events::{EventRecorder, EventType, KubeEventRecorder};
pub use gtid::GtidPosition;
pub use reconciler::{cancel_on_signal, run_controller, ControllerState};
pub use selector::{select_candidate, ReplicaPosition};
pub use sql::{MariaDbSql, NodeAddress, SqlControl};
pub use status::{update_status, KubeStatusStore, StatusStore, FIELD_MANAGER};
pub use switchover::{PhaseName, SwitchoverReport, SwitchoverRequest};
pub use traffic::{KubeTrafficCoordinator, TrafficCoordinator};
