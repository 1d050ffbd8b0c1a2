//! Cluster membership operations over the engine's SQL interface.
//!
//! The connector keeps a lazily-loaded snapshot of `SHOW STATUS` output —
//! a flat string map. Any accessor that needs status loads it on first
//! touch; every mutating cluster operation clears the snapshot and reloads,
//! so later reads see the post-mutation world.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{TableSpec, TABLE_TYPE_PERCOLATE, TABLE_TYPE_RT};
use crate::error::{Result, SentinelError};

use super::executor::{MysqlEndpoint, QueryExecutor, SqlEndpoint};
use super::EngineProbe;

/// Settings clause applied to managed tables when no mounted include
/// file is present.
pub const DEFAULT_RT_INCLUDE: &str = "charset_table = 'cjk, non_cjk'";

/// One row of `SHOW THREADS` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: Option<i64>,
    pub info: String,
}

impl ThreadInfo {
    /// Whether this thread is running the engine-internal compaction job.
    pub fn is_system_optimize(&self) -> bool {
        self.info.contains("SYSTEM OPTIMIZE")
    }
}

/// Cluster-aware wrapper over [`QueryExecutor`].
pub struct EngineConnector {
    executor: QueryExecutor,
    cluster_name: String,
    binary_port: u16,
    rt_include_path: PathBuf,
    fields: Vec<String>,
    status: BTreeMap<String, String>,
}

impl EngineConnector {
    /// Wrap an already-open endpoint. `short_cluster_name` gets the
    /// `_cluster` suffix appended for the engine-side identity.
    pub fn new(
        endpoint: Box<dyn SqlEndpoint>,
        short_cluster_name: Option<&str>,
        max_attempts: i32,
        binary_port: u16,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cluster_name = short_cluster_name
            .map(|name| format!("{}_cluster", name))
            .unwrap_or_default();

        Self {
            executor: QueryExecutor::new(endpoint, max_attempts, clock),
            cluster_name,
            binary_port,
            rt_include_path: PathBuf::from("/etc/searchd/conf_mount/rt_include.conf"),
            fields: Vec::new(),
            status: BTreeMap::new(),
        }
    }

    /// Dial the engine and wrap the connection.
    pub async fn connect(
        host: &str,
        port: u16,
        short_cluster_name: Option<&str>,
        max_attempts: i32,
        binary_port: u16,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let endpoint = MysqlEndpoint::connect(host, port, max_attempts, clock.as_ref()).await?;
        Ok(Self::new(
            Box::new(endpoint),
            short_cluster_name,
            max_attempts,
            binary_port,
            clock,
        ))
    }

    pub fn set_custom_cluster_name(&mut self, short_name: &str) {
        self.cluster_name = format!("{}_cluster", short_name);
    }

    pub fn set_max_attempts(&mut self, max_attempts: i32) {
        self.executor.set_max_attempts(max_attempts);
    }

    pub fn set_rt_include_path(&mut self, path: impl Into<PathBuf>) {
        self.rt_include_path = path.into();
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Reload the status snapshot from the engine.
    pub async fn load_status(&mut self, log: bool) -> Result<()> {
        self.status.clear();

        let rows = self.executor.fetch("SHOW STATUS", log).await?;
        for row in rows.unwrap_or_default() {
            if let (Some(counter), Some(value)) = (row.get("Counter"), row.get("Value")) {
                self.status.insert(counter.to_string(), value.to_string());
            }
        }

        Ok(())
    }

    async fn ensure_status(&mut self) -> Result<()> {
        if self.status.is_empty() {
            self.load_status(true).await?;
        }
        Ok(())
    }

    /// All table names, optionally filtered by engine type.
    pub async fn tables(&mut self, log: bool, type_filter: Option<&[&str]>) -> Result<Vec<String>> {
        let rows = self.executor.fetch("SHOW TABLES", log).await?;

        let mut tables = Vec::new();
        for row in rows.unwrap_or_default() {
            if let Some(filter) = type_filter {
                match row.get("Type") {
                    Some(table_type) if filter.contains(&table_type) => {}
                    _ => continue,
                }
            }
            if let Some(name) = row.get("Index") {
                tables.push(name.to_string());
            }
        }

        Ok(tables)
    }

    pub async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.tables(true, None).await?.iter().any(|t| t == table))
    }

    /// Whether the live cluster identity equals the configured one.
    pub async fn cluster_name_matches(&mut self) -> Result<bool> {
        self.ensure_status().await?;
        Ok(self
            .status
            .get("cluster_name")
            .is_some_and(|name| *name == self.cluster_name))
    }

    /// The engine's view of current cluster nodes, if a cluster exists.
    pub async fn view_nodes(&mut self) -> Result<Option<String>> {
        self.ensure_status().await?;

        let Some(live_name) = self.status.get("cluster_name") else {
            return Ok(None);
        };
        let key = format!("cluster_{}_nodes_view", live_name);
        Ok(self.status.get(&key).cloned())
    }

    /// Whether this node reports primary state for the live cluster.
    pub async fn is_primary(&mut self) -> Result<bool> {
        self.ensure_status().await?;

        let Some(live_name) = self.status.get("cluster_name") else {
            return Ok(false);
        };
        let key = format!("cluster_{}_status", live_name);
        Ok(self.status.get(&key).is_some_and(|state| state == "primary"))
    }

    async fn run_cluster_op(&mut self, statement: &str, log: bool) -> Result<bool> {
        match self.executor.execute(statement, log).await {
            Ok(_) => {
                self.status.clear();
                self.load_status(true).await?;
                Ok(true)
            }
            Err(error) => {
                warn!(statement, error = %error, "cluster operation failed");
                Ok(false)
            }
        }
    }

    /// Create the replication cluster. False on any connection error.
    pub async fn create_cluster(&mut self, log: bool) -> Result<bool> {
        let statement = format!("CREATE CLUSTER {}", self.cluster_name);
        self.run_cluster_op(&statement, log).await
    }

    /// Join the cluster through a seed host. No-op success if this node
    /// is already a member.
    pub async fn join_cluster(&mut self, seed_host: &str, log: bool) -> Result<bool> {
        if self.cluster_name_matches().await? {
            return Ok(true);
        }

        let statement = format!(
            "JOIN CLUSTER {} at '{}:{}'",
            self.cluster_name, seed_host, self.binary_port
        );
        self.run_cluster_op(&statement, log).await
    }

    /// Bootstrap a new primary after quorum loss.
    pub async fn restore_cluster(&mut self, log: bool) -> Result<bool> {
        let statement = format!("SET CLUSTER {} GLOBAL 'pc.bootstrap' = 1", self.cluster_name);
        self.run_cluster_op(&statement, log).await
    }

    /// Delete the replication cluster.
    pub async fn delete_cluster(&mut self, log: bool) -> Result<bool> {
        let statement = format!("DELETE CLUSTER {}", self.cluster_name);
        self.run_cluster_op(&statement, log).await
    }

    /// Candidates minus the cluster's membership list. An empty membership
    /// string means every candidate is missing.
    pub async fn tables_not_in_cluster(
        &mut self,
        candidates: Option<Vec<String>>,
    ) -> Result<Vec<String>> {
        let tables = match candidates {
            Some(tables) => tables,
            None => self.tables(true, None).await?,
        };

        self.ensure_status().await?;

        let key = format!("cluster_{}_indexes", self.cluster_name);
        let membership = self.status.get(&key).cloned().unwrap_or_default();
        if membership.is_empty() {
            return Ok(tables);
        }

        let members: Vec<&str> = membership.split(',').map(str::trim).collect();
        Ok(tables
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !members.contains(&t.as_str()))
            .collect())
    }

    /// Attach one table to the cluster. False on any connection error.
    pub async fn add_table_to_cluster(&mut self, table: &str, log: bool) -> Result<bool> {
        let statement = format!("ALTER CLUSTER {} ADD {}", self.cluster_name, table);
        self.run_cluster_op(&statement, log).await
    }

    /// Attach every table the cluster doesn't know about yet.
    pub async fn add_missing_tables_to_cluster(&mut self) -> Result<()> {
        for table in self.tables_not_in_cluster(None).await? {
            self.add_table_to_cluster(&table, true).await?;
            info!(table = %table, "table was added into cluster");
        }
        Ok(())
    }

    /// `disk_chunks` from the per-table status. A missing variable is an
    /// invariant violation, not a transient condition.
    pub async fn chunk_count(&mut self, table: &str, log: bool) -> Result<u32> {
        let statement = format!("SHOW TABLE {} STATUS", table);
        let rows = self.executor.fetch(&statement, log).await?;

        for row in rows.unwrap_or_default() {
            if row.get("Variable_name") == Some("disk_chunks") {
                if let Some(count) = row.get("Value").and_then(|v| v.parse().ok()) {
                    return Ok(count);
                }
            }
        }

        Err(SentinelError::ChunksUnavailable(table.to_string()))
    }

    /// Fire-and-forget compaction command.
    pub async fn optimize(&mut self, table: &str, cutoff: u32) -> Result<()> {
        let statement = format!("OPTIMIZE TABLE {} OPTION cutoff={}", table, cutoff);
        self.executor.execute(&statement, true).await?;
        Ok(())
    }

    /// Live thread list, used to detect in-flight optimize jobs.
    pub async fn threads(&mut self, log: bool) -> Result<Vec<ThreadInfo>> {
        let rows = self
            .executor
            .fetch("SHOW THREADS OPTION FORMAT=ALL", log)
            .await?;

        Ok(rows
            .unwrap_or_default()
            .iter()
            .map(|row| ThreadInfo {
                tid: row.get("Tid").and_then(|t| t.parse().ok()),
                info: row.get("Info").unwrap_or_default().to_string(),
            })
            .collect())
    }

    pub async fn reload_indexes(&mut self) -> Result<()> {
        self.executor.execute("RELOAD INDEXES", true).await?;
        Ok(())
    }

    /// Parse a `type=name|type=name` rule string into the column list used
    /// for table creation.
    ///
    /// Every managed table carries a leading `invalidjson` text column.
    /// `url` expands into host-path/query/anchor text columns. A token
    /// missing either side is a validation error.
    pub fn set_field_rules(&mut self, rules: &str) -> Result<()> {
        let mut fields = vec!["`invalidjson` text indexed".to_string()];

        for token in rules.split('|').filter(|t| !t.is_empty()) {
            let (field_type, name) = token
                .split_once('=')
                .ok_or_else(|| SentinelError::MalformedFieldRule(token.to_string()))?;

            if field_type.is_empty() || name.is_empty() {
                return Err(SentinelError::MalformedFieldRule(token.to_string()));
            }

            match field_type {
                "text" => fields.push(format!("`{}` text indexed", name)),
                "url" => {
                    fields.push(format!("`{}_host_path` text indexed", name));
                    fields.push(format!("`{}_query` text indexed", name));
                    fields.push(format!("`{}_anchor` text indexed", name));
                }
                other => fields.push(format!("`{}` {}", name, other)),
            }
        }

        self.fields = fields;
        Ok(())
    }

    fn rt_include(&self) -> String {
        match std::fs::read_to_string(&self.rt_include_path) {
            Ok(content) => content,
            Err(_) => DEFAULT_RT_INCLUDE.to_string(),
        }
    }

    /// Create a managed table. The field rules must be parsed first.
    pub async fn create_table(&mut self, table: &str, table_type: &str) -> Result<bool> {
        if table_type != TABLE_TYPE_PERCOLATE && table_type != TABLE_TYPE_RT {
            return Err(SentinelError::WrongTableType(table_type.to_string()));
        }

        if self.fields.is_empty() {
            return Err(SentinelError::FieldsNotInitialized(table.to_string()));
        }

        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) type='{}' {}",
            table,
            self.fields.join(","),
            table_type,
            self.rt_include()
        );

        match self.executor.execute(&statement, true).await {
            Ok(_) => Ok(true),
            Err(error) => {
                warn!(table, error = %error, "create table failed");
                Ok(false)
            }
        }
    }

    /// Converge the cluster and its managed tables.
    ///
    /// If this node already carries the cluster identity, create-and-attach
    /// whatever managed tables the cluster is missing. Otherwise create the
    /// cluster first and attach every managed table. Per-table failures are
    /// collected; the overall result is boolean.
    pub async fn ensure_schema(&mut self, specs: &[TableSpec]) -> Result<bool> {
        self.ensure_status().await?;
        let mut errors = Vec::new();

        if self.cluster_name_matches().await? {
            let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
            let missing = self.tables_not_in_cluster(Some(names)).await?;
            if missing.is_empty() {
                return Ok(true);
            }

            for name in missing {
                let Some(spec) = specs.iter().find(|s| s.name == name) else {
                    continue;
                };

                if !self.table_exists(&name).await?
                    && !self.create_table(&name, &spec.table_type).await?
                {
                    errors.push(format!("can't create table {}", name));
                    continue;
                }
                if !self.add_table_to_cluster(&name, true).await? {
                    errors.push(format!(
                        "can't add table {} to cluster {}",
                        name, self.cluster_name
                    ));
                }
            }
        } else if self.create_cluster(true).await? {
            for spec in specs {
                if !self.create_table(&spec.name, &spec.table_type).await? {
                    errors.push(format!("can't create table {}", spec.name));
                    continue;
                }
                if !self.add_table_to_cluster(&spec.name, true).await? {
                    errors.push(format!(
                        "can't add table {} to cluster {}",
                        spec.name, self.cluster_name
                    ));
                }
            }
        } else {
            return Ok(false);
        }

        if errors.is_empty() {
            return Ok(true);
        }

        for error in errors {
            warn!(error = %error, "schema convergence");
        }

        Ok(false)
    }

    pub(super) fn executor_mut(&mut self) -> &mut QueryExecutor {
        &mut self.executor
    }
}

#[async_trait]
impl EngineProbe for EngineConnector {
    async fn cluster_name_matches(&mut self) -> Result<bool> {
        EngineConnector::cluster_name_matches(self).await
    }

    async fn is_primary(&mut self) -> Result<bool> {
        EngineConnector::is_primary(self).await
    }

    async fn show_threads(&mut self) -> Result<Vec<ThreadInfo>> {
        self.threads(true).await
    }
}
