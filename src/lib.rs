//! mariadb-failover: Kubernetes operator for MariaDB primary/replica failover
//!
//! This crate watches `MariaDbCluster` resources, detects a failing primary,
//! and runs planned or unplanned switchovers between replicated MariaDB pods.

pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
