//! In-memory collaborators for controller tests
//!
//! Every fake appends the mutations it performs to a shared journal so tests
//! can assert on cross-system call order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::crd::MariaDbClusterStatus;
use crate::error::{Error, Result};

use super::detector::DesiredPrimaryWriter;
use super::events::{EventRecorder, EventType};
use super::gtid::GtidPosition;
use super::sql::{NodeAddress, SqlControl};
use super::status::{StatusStore, VersionedStatus};
use super::traffic::TrafficCoordinator;

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn new_journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

/// Entries of `journal` starting with `prefix`, in order
pub fn entries(journal: &Journal, prefix: &str) -> Vec<String> {
    journal
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with(prefix))
        .cloned()
        .collect()
}

/// Position of the first entry equal to `entry`
pub fn position(journal: &Journal, entry: &str) -> Option<usize> {
    journal.lock().unwrap().iter().position(|e| e == entry)
}

pub fn address(index: i32) -> NodeAddress {
    NodeAddress::new(
        index,
        format!("db-{}", index),
        format!("db-{}.db-internal.test.svc.cluster.local", index),
        3306,
    )
}

#[derive(Clone, Debug)]
pub struct FakeNode {
    pub reachable: bool,
    pub read_only: bool,
    pub locked: bool,
    pub gtid: GtidPosition,
    pub received: Option<GtidPosition>,
    pub source: Option<String>,
    /// Operations that answer with a SQL error
    pub failing: HashSet<&'static str>,
}

impl FakeNode {
    pub fn primary(gtid: &str) -> Self {
        Self {
            reachable: true,
            read_only: false,
            locked: false,
            gtid: gtid.parse().unwrap(),
            received: None,
            source: None,
            failing: HashSet::new(),
        }
    }

    pub fn replica_of(primary: &NodeAddress, gtid: &str) -> Self {
        Self {
            read_only: true,
            source: Some(primary.host.clone()),
            ..Self::primary(gtid)
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

pub struct FakeSql {
    journal: Journal,
    nodes: Mutex<HashMap<String, FakeNode>>,
}

impl FakeSql {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_node(self, node: &NodeAddress, state: FakeNode) -> Self {
        self.nodes.lock().unwrap().insert(node.name.clone(), state);
        self
    }

    pub fn node(&self, node: &NodeAddress) -> FakeNode {
        self.nodes.lock().unwrap()[&node.name].clone()
    }

    pub fn update(&self, node: &NodeAddress, f: impl FnOnce(&mut FakeNode)) {
        if let Some(state) = self.nodes.lock().unwrap().get_mut(&node.name) {
            f(state);
        }
    }

    fn with_reachable<T>(
        &self,
        node: &NodeAddress,
        op: &'static str,
        f: impl FnOnce(&mut FakeNode) -> T,
    ) -> Result<T> {
        let mut nodes = self.nodes.lock().unwrap();
        let state = nodes.get_mut(&node.name).ok_or_else(|| Error::Unreachable {
            node: node.name.clone(),
            reason: "no such host".to_string(),
        })?;
        if !state.reachable {
            return Err(Error::Unreachable {
                node: node.name.clone(),
                reason: "connect timeout".to_string(),
            });
        }
        if state.failing.contains(op) {
            return Err(Error::Sql {
                node: node.name.clone(),
                source: sqlx::Error::Protocol(format!("injected {} failure", op)),
            });
        }
        Ok(f(state))
    }
}

#[async_trait]
impl SqlControl for FakeSql {
    async fn probe(&self, node: &NodeAddress, _timeout: Duration) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(&node.name)
            .map(|n| n.reachable)
            .unwrap_or(false)
    }

    async fn acquire_read_lock(&self, node: &NodeAddress) -> Result<()> {
        self.with_reachable(node, "lock", |n| n.locked = true)?;
        record(&self.journal, format!("sql:lock:{}", node.name));
        Ok(())
    }

    async fn release_read_lock(&self, node: &NodeAddress) -> Result<()> {
        self.with_reachable(node, "unlock", |n| n.locked = false)?;
        record(&self.journal, format!("sql:unlock:{}", node.name));
        Ok(())
    }

    async fn set_read_only(&self, node: &NodeAddress, read_only: bool) -> Result<()> {
        self.with_reachable(node, "read_only", |n| n.read_only = read_only)?;
        record(
            &self.journal,
            format!("sql:read_only:{}:{}", node.name, read_only),
        );
        Ok(())
    }

    async fn is_read_only(&self, node: &NodeAddress) -> Result<bool> {
        self.with_reachable(node, "is_read_only", |n| n.read_only)
    }

    async fn gtid_position(&self, node: &NodeAddress) -> Result<GtidPosition> {
        self.with_reachable(node, "gtid", |n| n.gtid.clone())
    }

    async fn replication_source(&self, node: &NodeAddress) -> Result<Option<String>> {
        self.with_reachable(node, "source", |n| n.source.clone())
    }

    async fn received_position(&self, node: &NodeAddress) -> Result<Option<GtidPosition>> {
        self.with_reachable(node, "received", |n| n.received.clone())
    }

    async fn reconfigure_as_replica_of(
        &self,
        node: &NodeAddress,
        primary: &NodeAddress,
    ) -> Result<()> {
        let host = primary.host.clone();
        self.with_reachable(node, "replica", |n| {
            n.source = Some(host);
            n.read_only = true;
        })?;
        record(
            &self.journal,
            format!("sql:replica:{}->{}", node.name, primary.name),
        );
        Ok(())
    }

    async fn reconfigure_as_primary(&self, node: &NodeAddress) -> Result<()> {
        self.with_reachable(node, "promote", |n| {
            n.source = None;
            n.read_only = false;
        })?;
        record(&self.journal, format!("sql:promote:{}", node.name));
        Ok(())
    }
}

pub struct FakeTraffic {
    journal: Journal,
    gateway: bool,
    binding: Mutex<Option<String>>,
    failing: Mutex<HashSet<&'static str>>,
    cancel_on: Mutex<HashMap<&'static str, CancellationToken>>,
}

impl FakeTraffic {
    pub fn new(journal: Journal, gateway: bool) -> Self {
        Self {
            journal,
            gateway,
            binding: Mutex::new(None),
            failing: Mutex::new(HashSet::new()),
            cancel_on: Mutex::new(HashMap::new()),
        }
    }

    pub fn bound_to(self, pod: &str) -> Self {
        *self.binding.lock().unwrap() = Some(pod.to_string());
        self
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn binding(&self) -> Option<String> {
        self.binding.lock().unwrap().clone()
    }

    /// Cancel `token` when `op` is invoked, as a superseding request would
    pub fn cancel_on(&self, op: &'static str, token: CancellationToken) {
        self.cancel_on.lock().unwrap().insert(op, token);
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if let Some(token) = self.cancel_on.lock().unwrap().get(op) {
            token.cancel();
        }
        if self.failing.lock().unwrap().contains(op) {
            return Err(Error::TrafficCoordinatorError(format!(
                "injected {} failure",
                op
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TrafficCoordinator for FakeTraffic {
    fn has_gateway(&self) -> bool {
        self.gateway
    }

    async fn ensure_primary_service(&self) -> Result<()> {
        self.check("service")?;
        record(&self.journal, "traffic:service".to_string());
        Ok(())
    }

    async fn drain_new_connections(&self, old_primary: &NodeAddress) -> Result<()> {
        self.check("drain")?;
        record(&self.journal, format!("traffic:drain:{}", old_primary.name));
        let mut binding = self.binding.lock().unwrap();
        if binding.as_deref() == Some(old_primary.name.as_str()) {
            *binding = None;
        }
        Ok(())
    }

    async fn terminate_existing_connections(&self, old_primary: &NodeAddress) -> Result<()> {
        self.check("terminate")?;
        record(
            &self.journal,
            format!("traffic:terminate:{}", old_primary.name),
        );
        Ok(())
    }

    async fn wait_ready(&self, _timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.check("wait_ready")?;
        record(&self.journal, "traffic:wait_ready".to_string());
        Ok(())
    }

    async fn rebind_primary(&self, new_primary: &NodeAddress) -> Result<()> {
        self.check("rebind")?;
        record(&self.journal, format!("traffic:rebind:{}", new_primary.name));
        *self.binding.lock().unwrap() = Some(new_primary.name.clone());
        Ok(())
    }

    async fn current_binding(&self) -> Result<Option<String>> {
        self.check("binding")?;
        Ok(self.binding())
    }
}

pub struct FakeStatusStore {
    journal: Journal,
    state: Mutex<VersionedStatus>,
    conflicts: AtomicU32,
    writes: AtomicU32,
}

impl FakeStatusStore {
    pub fn new(journal: Journal, status: MariaDbClusterStatus, desired: i32) -> Self {
        Self {
            journal,
            state: Mutex::new(VersionedStatus {
                resource_version: Some("1".to_string()),
                generation: Some(1),
                desired_primary_index: desired,
                status,
            }),
            conflicts: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        }
    }

    /// Make the next `n` writes lose against a simulated concurrent writer
    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    pub fn current(&self) -> VersionedStatus {
        self.state.lock().unwrap().clone()
    }

    pub fn write_attempts(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_desired(&self, index: i32) {
        let mut state = self.state.lock().unwrap();
        state.desired_primary_index = index;
        bump(&mut state);
    }
}

fn bump(state: &mut VersionedStatus) {
    let next = state
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    state.resource_version = Some(next.to_string());
}

#[async_trait]
impl StatusStore for FakeStatusStore {
    async fn fetch(&self) -> Result<VersionedStatus> {
        Ok(self.current())
    }

    async fn write(
        &self,
        expected_version: Option<&str>,
        status: &MariaDbClusterStatus,
    ) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bump(&mut state);
            return Err(Error::ConcurrentModification("injected".to_string()));
        }
        if expected_version != state.resource_version.as_deref() {
            return Err(Error::ConcurrentModification("stale version".to_string()));
        }
        state.status = status.clone();
        bump(&mut state);
        record(
            &self.journal,
            format!(
                "status:write:{}",
                status
                    .last_switchover_phase
                    .clone()
                    .unwrap_or_else(|| "-".to_string())
            ),
        );
        Ok(())
    }
}

#[async_trait]
impl DesiredPrimaryWriter for FakeStatusStore {
    async fn set_desired_primary(&self, expected_version: Option<&str>, index: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if expected_version != state.resource_version.as_deref() {
            return Err(Error::ConcurrentModification("stale version".to_string()));
        }
        state.desired_primary_index = index;
        bump(&mut state);
        record(&self.journal, format!("desired:{}", index));
        Ok(())
    }
}

pub struct FakeEvents {
    journal: Journal,
    events: Mutex<Vec<(EventType, String, String)>>,
}

impl FakeEvents {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn reasons(&self, event_type: EventType) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| *t == event_type)
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for FakeEvents {
    async fn publish(&self, event_type: EventType, reason: &str, message: &str) -> Result<()> {
        record(
            &self.journal,
            format!("event:{}:{}", event_type.as_str(), reason),
        );
        self.events
            .lock()
            .unwrap()
            .push((event_type, reason.to_string(), message.to_string()));
        Ok(())
    }
}
