//! REST API module for external integrations
//!
//! Read-only view of MariaDbClusters. Planned switchovers are requested by
//! patching `spec.replication.primary.podIndex`, so they go through the
//! API server's authentication and RBAC.

mod dto;
mod handlers;
mod server;

pub use dto::{ClusterDetailResponse, ClusterSummary};
pub use server::{router, run_server};
