//! Custom Resource Definitions for the MariaDB failover operator
//!
//! This module defines the `MariaDbCluster` CRD and its supporting types.

mod mariadb_cluster;
pub mod types;


pub use mariadb_cluster::{
    parse_gateway_annotation, MariaDbCluster, MariaDbClusterSpec, MariaDbClusterStatus,
    SpecValidationError, GATEWAY_ANNOTATION,
};
pub use types::*;
