//! Per-node SQL control client for MariaDB
//!
//! Every call runs under an explicit timeout. A node that does not answer in
//! time, or cannot be connected to, yields `Error::Unreachable`; a node that
//! answers with an error yields `Error::Sql`. Primary-local switchover phases
//! branch on that distinction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{api::Api, Client, ResourceExt};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{ConnectOptions, Executor, Row};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::crd::{CredentialsRef, MariaDbCluster};
use crate::error::{Error, Result};

use super::gtid::GtidPosition;
use super::wait::poll_until_success_or_cancelled;

/// Network identity of one database pod
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub index: i32,
    /// Pod name, used as the node label in errors and logs
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(index: i32, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            index,
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// Address of ordinal `index` of `cluster`
    pub fn for_pod(cluster: &MariaDbCluster, index: i32) -> Self {
        let port = u16::try_from(cluster.spec.port).unwrap_or(3306);
        Self::new(index, cluster.pod_name(index), cluster.pod_host(index), port)
    }
}

/// Command/query interface to the database engine on each node
#[async_trait]
pub trait SqlControl: Send + Sync {
    /// Liveness probe; never errors, only reports reachability
    async fn probe(&self, node: &NodeAddress, timeout: Duration) -> bool;

    /// Take a global read lock, held until `release_read_lock`
    async fn acquire_read_lock(&self, node: &NodeAddress) -> Result<()>;

    async fn release_read_lock(&self, node: &NodeAddress) -> Result<()>;

    async fn set_read_only(&self, node: &NodeAddress, read_only: bool) -> Result<()>;

    async fn is_read_only(&self, node: &NodeAddress) -> Result<bool>;

    /// Executed transaction position (`gtid_current_pos`)
    async fn gtid_position(&self, node: &NodeAddress) -> Result<GtidPosition>;

    /// Host the node replicates from, `None` when it is not a replica
    async fn replication_source(&self, node: &NodeAddress) -> Result<Option<String>>;

    /// Position received from the source but possibly not yet applied (`Gtid_IO_Pos`)
    async fn received_position(&self, node: &NodeAddress) -> Result<Option<GtidPosition>>;

    async fn reconfigure_as_replica_of(&self, node: &NodeAddress, primary: &NodeAddress)
        -> Result<()>;

    async fn reconfigure_as_primary(&self, node: &NodeAddress) -> Result<()>;

    /// Poll `node` until its executed position dominates `target`.
    ///
    /// Returns `Error::SyncTimeout` when `timeout` elapses first and
    /// `Error::Cancelled` as soon as `cancel` fires.
    async fn wait_until_caught_up(
        &self,
        node: &NodeAddress,
        target: &GtidPosition,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let last_seen = StdMutex::new(String::from("unknown"));
        let seen = &last_seen;
        let result = poll_until_success_or_cancelled(cancel, interval, timeout, move || async move {
            let position = self.gtid_position(node).await?;
            if let Ok(mut slot) = seen.lock() {
                *slot = position.to_string();
            }
            if position.has_reached(target) {
                Ok(())
            } else {
                Err(Error::SyncTimeout {
                    node: node.name.clone(),
                    target: target.to_string(),
                    last_seen: position.to_string(),
                })
            }
        })
        .await;

        match result {
            Err(Error::DeadlineExceeded { .. }) => Err(Error::SyncTimeout {
                node: node.name.clone(),
                target: target.to_string(),
                last_seen: last_seen
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
            }),
            other => other,
        }
    }
}

/// Login for one connection role
#[derive(Clone)]
pub struct SqlCredentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for SqlCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SqlTimeouts {
    pub connect: Duration,
    pub command: Duration,
}

/// `SqlControl` over direct MariaDB connections
pub struct MariaDbSql {
    credentials: SqlCredentials,
    replication_credentials: SqlCredentials,
    timeouts: SqlTimeouts,
    /// Connections holding `FLUSH TABLES WITH READ LOCK`, keyed by pod name
    locks: Mutex<HashMap<String, MySqlConnection>>,
}

impl MariaDbSql {
    pub fn new(
        credentials: SqlCredentials,
        replication_credentials: SqlCredentials,
        timeouts: SqlTimeouts,
    ) -> Self {
        Self {
            credentials,
            replication_credentials,
            timeouts,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build a client from the cluster's credential Secrets
    pub async fn from_cluster(client: &Client, cluster: &MariaDbCluster) -> Result<Self> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

        let credentials = read_credentials(&secrets, &cluster.spec.credentials).await?;
        let replication_credentials = match &cluster.spec.replication.replication_credentials {
            Some(reference) => read_credentials(&secrets, reference).await?,
            None => credentials.clone(),
        };
        let replication = &cluster.spec.replication;
        Ok(Self::new(
            credentials,
            replication_credentials,
            SqlTimeouts {
                connect: Duration::from_secs(replication.connect_timeout_seconds),
                command: Duration::from_secs(replication.command_timeout_seconds),
            },
        ))
    }

    fn connect_options(&self, node: &NodeAddress) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&node.host)
            .port(node.port)
            .username(&self.credentials.user)
            .password(&self.credentials.password)
    }

    async fn connect(&self, node: &NodeAddress) -> Result<MySqlConnection> {
        bounded(node, self.timeouts.connect, self.connect_options(node).connect()).await
    }

    async fn execute_on(
        &self,
        node: &NodeAddress,
        conn: &mut MySqlConnection,
        statement: &str,
    ) -> Result<()> {
        debug!("{}: {}", node.name, redact(statement));
        bounded(
            node,
            self.timeouts.command,
            (&mut *conn).execute(sqlx::raw_sql(statement)),
        )
        .await
        .map(|_| ())
    }

    async fn execute_all(&self, node: &NodeAddress, statements: &[String]) -> Result<()> {
        let mut conn = self.connect(node).await?;
        for statement in statements {
            self.execute_on(node, &mut conn, statement).await?;
        }
        Ok(())
    }

    async fn query_optional(&self, node: &NodeAddress, query: &str) -> Result<Option<MySqlRow>> {
        let mut conn = self.connect(node).await?;
        bounded(
            node,
            self.timeouts.command,
            (&mut conn).fetch_optional(sqlx::raw_sql(query)),
        )
        .await
    }

    async fn query_text(&self, node: &NodeAddress, query: &str) -> Result<String> {
        let row = self.query_optional(node, query).await?;
        row.as_ref()
            .and_then(|r| column_text(r, 0))
            .ok_or_else(|| Error::Unreachable {
                node: node.name.clone(),
                reason: format!("empty result for '{}'", query),
            })
    }

    async fn slave_status(&self, node: &NodeAddress) -> Result<Option<MySqlRow>> {
        self.query_optional(node, "SHOW SLAVE STATUS").await
    }
}

#[async_trait]
impl SqlControl for MariaDbSql {
    async fn probe(&self, node: &NodeAddress, timeout: Duration) -> bool {
        let attempt = async {
            let mut conn = self.connect_options(node).connect().await?;
            (&mut conn).execute(sqlx::raw_sql("SELECT 1")).await
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", node.name, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", node.name, timeout);
                false
            }
        }
    }

    #[instrument(skip(self), fields(node = %node.name))]
    async fn acquire_read_lock(&self, node: &NodeAddress) -> Result<()> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(&node.name) {
            debug!("Read lock already held on {}", node.name);
            return Ok(());
        }
        let mut conn = self.connect(node).await?;
        self.execute_on(node, &mut conn, "FLUSH TABLES WITH READ LOCK")
            .await?;
        locks.insert(node.name.clone(), conn);
        info!("Acquired global read lock on {}", node.name);
        Ok(())
    }

    #[instrument(skip(self), fields(node = %node.name))]
    async fn release_read_lock(&self, node: &NodeAddress) -> Result<()> {
        let held = self.locks.lock().await.remove(&node.name);
        if let Some(mut conn) = held {
            // dropping the connection releases the lock server side as well
            self.execute_on(node, &mut conn, "UNLOCK TABLES").await?;
            info!("Released global read lock on {}", node.name);
        }
        Ok(())
    }

    async fn set_read_only(&self, node: &NodeAddress, read_only: bool) -> Result<()> {
        let statement = format!("SET GLOBAL read_only={}", u8::from(read_only));
        // the lock-holding session must issue it, other sessions block behind the lock
        let mut locks = self.locks.lock().await;
        if let Some(conn) = locks.get_mut(&node.name) {
            return self.execute_on(node, conn, &statement).await;
        }
        drop(locks);
        self.execute_all(node, &[statement]).await
    }

    async fn is_read_only(&self, node: &NodeAddress) -> Result<bool> {
        let value = self
            .query_text(node, "SELECT CAST(@@global.read_only AS CHAR)")
            .await?;
        Ok(matches!(value.trim(), "1" | "ON"))
    }

    async fn gtid_position(&self, node: &NodeAddress) -> Result<GtidPosition> {
        let value = self
            .query_text(node, "SELECT CAST(@@global.gtid_current_pos AS CHAR)")
            .await?;
        value.parse()
    }

    async fn replication_source(&self, node: &NodeAddress) -> Result<Option<String>> {
        let row = self.slave_status(node).await?;
        Ok(row
            .as_ref()
            .and_then(|r| named_column_text(r, "Master_Host"))
            .filter(|host| !host.is_empty()))
    }

    async fn received_position(&self, node: &NodeAddress) -> Result<Option<GtidPosition>> {
        let row = self.slave_status(node).await?;
        match row.as_ref().and_then(|r| named_column_text(r, "Gtid_IO_Pos")) {
            Some(pos) => Ok(Some(pos.parse()?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(node = %node.name, primary = %primary.name))]
    async fn reconfigure_as_replica_of(
        &self,
        node: &NodeAddress,
        primary: &NodeAddress,
    ) -> Result<()> {
        let statements = replica_statements(primary, &self.replication_credentials);
        self.execute_all(node, &statements).await?;
        info!("{} now replicates from {}", node.name, primary.name);
        Ok(())
    }

    #[instrument(skip(self), fields(node = %node.name))]
    async fn reconfigure_as_primary(&self, node: &NodeAddress) -> Result<()> {
        let statements = [
            "STOP ALL SLAVES".to_string(),
            "RESET SLAVE ALL".to_string(),
            "SET GLOBAL read_only=0".to_string(),
        ];
        self.execute_all(node, &statements).await?;
        info!("{} configured as primary", node.name);
        Ok(())
    }
}

async fn read_credentials(secrets: &Api<Secret>, reference: &CredentialsRef) -> Result<SqlCredentials> {
    let secret = secrets.get(&reference.name).await?;
    let data = secret.data.unwrap_or_default();
    let field = |key: &str| -> Result<String> {
        data.get(key)
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "Secret {} has no key '{}'",
                    reference.name, key
                ))
            })
    };
    Ok(SqlCredentials {
        user: field(&reference.user_key)?,
        password: field(&reference.password_key)?,
    })
}

/// Await `fut` for at most `limit`, classifying failures for `node`
async fn bounded<T, F>(node: &NodeAddress, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(classify(node, e)),
        Err(_) => Err(Error::Unreachable {
            node: node.name.clone(),
            reason: format!("no response within {:?}", limit),
        }),
    }
}

fn classify(node: &NodeAddress, err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::Unreachable {
            node: node.name.clone(),
            reason: err.to_string(),
        },
        other => Error::Sql {
            node: node.name.clone(),
            source: other,
        },
    }
}

fn column_text(row: &MySqlRow, index: usize) -> Option<String> {
    row.try_get::<Option<String>, _>(index)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(index)
                .ok()
                .flatten()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
        })
}

fn named_column_text(row: &MySqlRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
        })
}

/// Quote `value` as a SQL string literal
fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            '\0' => quoted.push_str("\\0"),
            other => quoted.push(other),
        }
    }
    quoted.push('\'');
    quoted
}

/// Statements that turn a node into a GTID replica of `primary`
fn replica_statements(primary: &NodeAddress, credentials: &SqlCredentials) -> Vec<String> {
    vec![
        "STOP ALL SLAVES".to_string(),
        "SET GLOBAL gtid_slave_pos=@@global.gtid_current_pos".to_string(),
        format!(
            "CHANGE MASTER TO MASTER_HOST={}, MASTER_PORT={}, MASTER_USER={}, MASTER_PASSWORD={}, MASTER_USE_GTID=slave_pos",
            quote_literal(&primary.host),
            primary.port,
            quote_literal(&credentials.user),
            quote_literal(&credentials.password),
        ),
        "START SLAVE".to_string(),
        "SET GLOBAL read_only=1".to_string(),
    ]
}

fn redact(statement: &str) -> &str {
    if statement.starts_with("CHANGE MASTER") {
        "CHANGE MASTER TO <redacted>"
    } else {
        statement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> SqlCredentials {
        SqlCredentials {
            user: "repl".to_string(),
            password: "s3cr'et".to_string(),
        }
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_replica_statements_use_gtid_and_end_read_only() {
        let primary = NodeAddress::new(2, "db-2", "db-2.db-internal.ns.svc.cluster.local", 3306);
        let statements = replica_statements(&primary, &creds());
        assert_eq!(statements.first().map(String::as_str), Some("STOP ALL SLAVES"));
        assert!(statements[2].contains("MASTER_HOST='db-2.db-internal.ns.svc.cluster.local'"));
        assert!(statements[2].contains("MASTER_PASSWORD='s3cr''et'"));
        assert!(statements[2].ends_with("MASTER_USE_GTID=slave_pos"));
        assert_eq!(statements.last().map(String::as_str), Some("SET GLOBAL read_only=1"));
    }

    #[test]
    fn test_change_master_is_redacted_in_logs() {
        let primary = NodeAddress::new(0, "db-0", "db-0", 3306);
        let statements = replica_statements(&primary, &creds());
        assert!(!redact(&statements[2]).contains("s3cr"));
        assert_eq!(redact("START SLAVE"), "START SLAVE");
    }

    #[test]
    fn test_classify_io_as_unreachable() {
        let node = NodeAddress::new(0, "db-0", "db-0", 3306);
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(classify(&node, io).is_unreachable());
        assert!(!classify(&node, sqlx::Error::RowNotFound).is_unreachable());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let rendered = format!("{:?}", creds());
        assert!(!rendered.contains("s3cr"));
    }
}
