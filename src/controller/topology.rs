//! Live view of the cluster's nodes, rebuilt from probes on every pass

use std::time::Duration;

use futures::future::join_all;
use tracing::debug;

use crate::crd::MariaDbCluster;

use super::gtid::GtidPosition;
use super::selector::ReplicaPosition;
use super::sql::{NodeAddress, SqlControl};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Primary,
    Replica,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub address: NodeAddress,
    pub role: NodeRole,
    /// Executed GTID position at probe time, if it could be read
    pub gtid: Option<GtidPosition>,
    pub reachable: bool,
}

impl NodeDescriptor {
    pub fn index(&self) -> i32 {
        self.address.index
    }

    pub fn name(&self) -> &str {
        &self.address.name
    }
}

/// Snapshot of every ordinal in the cluster
#[derive(Clone, Debug, Default)]
pub struct ClusterTopology {
    nodes: Vec<NodeDescriptor>,
}

/// Addresses of all ordinals `0..replicas`
pub fn node_addresses(cluster: &MariaDbCluster) -> Vec<NodeAddress> {
    (0..cluster.spec.replicas.max(0))
        .map(|i| NodeAddress::for_pod(cluster, i))
        .collect()
}

impl ClusterTopology {
    pub fn from_nodes(nodes: Vec<NodeDescriptor>) -> Self {
        Self { nodes }
    }

    /// Probe every node concurrently; probes and position reads are read-only
    pub async fn observe(
        sql: &dyn SqlControl,
        addresses: Vec<NodeAddress>,
        primary_index: i32,
        probe_timeout: Duration,
    ) -> Self {
        let probes = addresses.into_iter().map(|address| async move {
            let reachable = sql.probe(&address, probe_timeout).await;
            let gtid = if reachable {
                match sql.gtid_position(&address).await {
                    Ok(position) => Some(position),
                    Err(e) => {
                        debug!("Could not read GTID position of {}: {}", address.name, e);
                        None
                    }
                }
            } else {
                None
            };
            let role = if address.index == primary_index {
                NodeRole::Primary
            } else {
                NodeRole::Replica
            };
            NodeDescriptor {
                address,
                role,
                gtid,
                reachable,
            }
        });
        Self {
            nodes: join_all(probes).await,
        }
    }

    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    pub fn node(&self, index: i32) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.index() == index)
    }

    pub fn primary(&self) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.role == NodeRole::Primary)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Replica)
    }

    pub fn is_reachable(&self, index: i32) -> bool {
        self.node(index).map(|n| n.reachable).unwrap_or(false)
    }

    /// Positions of reachable replicas with a readable GTID, for candidate selection
    pub fn replica_positions(&self) -> Vec<ReplicaPosition> {
        self.replicas()
            .filter(|n| n.reachable)
            .filter_map(|n| {
                n.gtid
                    .as_ref()
                    .map(|g| ReplicaPosition::new(n.index(), g.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(index: i32, role: NodeRole, gtid: Option<&str>, reachable: bool) -> NodeDescriptor {
        NodeDescriptor {
            address: NodeAddress::new(index, format!("db-{}", index), format!("db-{}", index), 3306),
            role,
            gtid: gtid.map(|g| g.parse().unwrap()),
            reachable,
        }
    }

    #[test]
    fn test_replica_positions_skip_unreachable_and_unknown() {
        let topology = ClusterTopology::from_nodes(vec![
            node(0, NodeRole::Primary, Some("0-1-20"), true),
            node(1, NodeRole::Replica, Some("0-1-10"), true),
            node(2, NodeRole::Replica, Some("0-1-12"), false),
            node(3, NodeRole::Replica, None, true),
        ]);
        let positions = topology.replica_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].index, 1);
        assert_eq!(topology.primary().map(|n| n.index()), Some(0));
        assert!(!topology.is_reachable(2));
        assert!(!topology.is_reachable(9));
    }
}
