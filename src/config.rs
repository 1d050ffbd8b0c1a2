//! Configuration for the sentinel agent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SentinelError};

/// Table layout kinds the agent manages.
pub const TABLE_TYPE_PERCOLATE: &str = "percolate";
pub const TABLE_TYPE_RT: &str = "rt";

/// Main configuration for one agent process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Engine connection settings.
    pub engine: EngineConfig,
    /// Peer discovery settings.
    pub discovery: DiscoveryConfig,
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Table maintenance settings.
    pub optimize: OptimizeConfig,
    /// Chat webhook notification settings.
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Tables this agent keeps registered in the cluster.
    #[serde(default = "default_tables")]
    pub tables: Vec<TableSpec>,
    /// Disables all network-touching discovery paths. Local runs only.
    #[serde(default)]
    pub dev_mode: bool,
}

impl AgentConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SentinelError::Config(format!("failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| SentinelError::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.engine.cluster_name.is_empty() {
            return Err(SentinelError::Config(
                "engine.cluster_name must be non-empty".to_string(),
            ));
        }

        if self.engine.worker_port == 0 || self.engine.binary_port == 0 {
            return Err(SentinelError::Config(
                "engine ports must be non-zero".to_string(),
            ));
        }

        for table in &self.tables {
            if table.table_type != TABLE_TYPE_PERCOLATE && table.table_type != TABLE_TYPE_RT {
                return Err(SentinelError::Config(format!(
                    "unknown type {} for table {}",
                    table.table_type, table.name
                )));
            }
        }

        Ok(())
    }

    /// Minimal configuration for local development runs.
    pub fn development() -> Self {
        Self {
            engine: EngineConfig::default(),
            discovery: DiscoveryConfig::default(),
            paths: PathsConfig {
                manifest_path: PathBuf::from("/tmp/sentinel/searchd.json"),
                data_dir: PathBuf::from("/tmp/sentinel/data"),
                lock_dir: PathBuf::from("/tmp"),
                optimize_lock_path: Some(PathBuf::from("/tmp/optimize.process.lock")),
                rt_include_path: PathBuf::from("/tmp/sentinel/rt_include.conf"),
                cache_path: PathBuf::from("/tmp/table_hash.dat"),
            },
            optimize: OptimizeConfig::default(),
            notify: NotifyConfig::default(),
            tables: default_tables(),
            dev_mode: true,
        }
    }

    /// The cluster identity as the engine reports it.
    pub fn full_cluster_name(&self) -> String {
        format!("{}_cluster", self.engine.cluster_name)
    }
}

/// Engine connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine host this agent sits next to.
    pub host: String,
    /// SQL-protocol port.
    pub worker_port: u16,
    /// Binary replication port used for JOIN CLUSTER and node lists.
    pub binary_port: u16,
    /// Short cluster name; `_cluster` is appended for the engine identity.
    pub cluster_name: String,
    /// Query retry bound. Negative means retry indefinitely.
    pub max_attempts: i32,
    /// Schema rules for managed tables, `type=name|type=name` format.
    #[serde(default)]
    pub field_rules: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            worker_port: 9306,
            binary_port: 9312,
            cluster_name: "m".to_string(),
            max_attempts: 30,
            field_rules: None,
        }
    }
}

/// Peer discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Label selector for peer pods.
    pub labels: BTreeMap<String, String>,
    /// Seconds to wait for a named peer to become ready.
    pub peer_wait_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/component".to_string(), "worker".to_string());

        Self {
            labels,
            peer_wait_timeout_secs: 300,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Persisted cluster configuration document.
    pub manifest_path: PathBuf,
    /// Engine data directory; table subdirectories live here.
    pub data_dir: PathBuf,
    /// Directory for process lock artifacts.
    pub lock_dir: PathBuf,
    /// Fleet-wide optimize claim artifact.
    pub optimize_lock_path: Option<PathBuf>,
    /// Mounted rt-include settings, optional.
    pub rt_include_path: PathBuf,
    /// On-disk idempotency bookkeeping.
    pub cache_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("/var/lib/searchd/searchd.json"),
            data_dir: PathBuf::from("/var/lib/searchd"),
            lock_dir: PathBuf::from("/tmp"),
            optimize_lock_path: Some(PathBuf::from("/tmp/optimize.process.lock")),
            rt_include_path: PathBuf::from("/etc/searchd/conf_mount/rt_include.conf"),
            cache_path: PathBuf::from("/tmp/table_hash.dat"),
        }
    }
}

/// Table maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeConfig {
    /// Disk-chunk count above which a table is optimized.
    pub chunk_threshold: u32,
    /// Target chunk count passed as the OPTIMIZE cutoff.
    pub cutoff: u32,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 16,
            cutoff: 8,
        }
    }
}

/// Chat webhook notification settings. Disabled when token is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub chat_id: Option<String>,
    pub token: Option<String>,
}

/// A managed table: name plus layout kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub table_type: String,
}

fn default_tables() -> Vec<TableSpec> {
    vec![
        TableSpec {
            name: "pq".to_string(),
            table_type: TABLE_TYPE_PERCOLATE.to_string(),
        },
        TableSpec {
            name: "tests".to_string(),
            table_type: TABLE_TYPE_RT.to_string(),
        },
    ]
}
