//! Persisted cluster configuration document.
//!
//! The engine keeps its cluster and table registry in a JSON document on
//! disk. The agent reconciles that document against live discovery:
//! merging freshly-seen nodes into the persisted node list, recovering
//! tables whose data files survived a crash but fell out of the registry,
//! and judging whole-cluster primary consensus across peers.
//!
//! The document is read whole and written whole; persists happen only
//! when a merge actually changed something.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TableSpec;
use crate::engine::ProbeFactory;
use crate::error::Result;
use crate::k8s::PodTracker;
use crate::notify::Notifier;

/// The on-disk document shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestDoc {
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterEntry>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableEntry>,
}

/// One replication cluster: node CSV, options, attached tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterEntry {
    #[serde(default)]
    pub nodes: String,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub tables: Vec<String>,
}

/// One registered table: layout kind plus on-disk path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    #[serde(rename = "type")]
    pub table_type: String,
    pub path: String,
}

/// Whole-document read/write, injected for tests.
pub trait ManifestStore: Send + Sync {
    /// Read the document; a missing file is an empty document.
    fn read(&self) -> Result<ManifestDoc>;
    fn save(&self, doc: &ManifestDoc) -> Result<()>;
}

/// Production store over a fixed file path.
pub struct FileManifestStore {
    path: PathBuf,
}

impl FileManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ManifestStore for FileManifestStore {
    fn read(&self) -> Result<ManifestDoc> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(ManifestDoc::default())
            }
            Err(error) => Err(error.into()),
        }
    }

    fn save(&self, doc: &ManifestDoc) -> Result<()> {
        let serialized = serde_json::to_string_pretty(doc)?;
        std::fs::write(&self.path, serialized)?;
        Ok(())
    }
}

/// In-memory store for development runs.
struct NullStore;

impl ManifestStore for NullStore {
    fn read(&self) -> Result<ManifestDoc> {
        Ok(ManifestDoc::default())
    }

    fn save(&self, _doc: &ManifestDoc) -> Result<()> {
        Ok(())
    }
}

/// The reconciled view of the persisted document.
pub struct ClusterManifest {
    short_name: String,
    cluster_name: String,
    binary_port: u16,
    doc: ManifestDoc,
    store: Arc<dyn ManifestStore>,
    probes: Arc<dyn ProbeFactory>,
}

impl ClusterManifest {
    pub fn load(
        short_name: &str,
        binary_port: u16,
        store: Arc<dyn ManifestStore>,
        probes: Arc<dyn ProbeFactory>,
    ) -> Result<Self> {
        let doc = store.read()?;

        Ok(Self {
            short_name: short_name.to_string(),
            cluster_name: format!("{}_cluster", short_name),
            binary_port,
            doc,
            store,
            probes,
        })
    }

    /// Fixture document for local development: two static nodes plus the
    /// default managed tables.
    pub fn development(short_name: &str, binary_port: u16, probes: Arc<dyn ProbeFactory>) -> Self {
        let cluster_name = format!("{}_cluster", short_name);

        let mut clusters = BTreeMap::new();
        clusters.insert(
            cluster_name.clone(),
            ClusterEntry {
                nodes: format!("192.168.0.1:{0},92.168.0.1:{0}", binary_port),
                options: String::new(),
                tables: vec!["pq".to_string(), "tests".to_string()],
            },
        );

        let mut tables = BTreeMap::new();
        tables.insert(
            "pq".to_string(),
            TableEntry {
                table_type: "percolate".to_string(),
                path: "pq".to_string(),
            },
        );
        tables.insert(
            "tests".to_string(),
            TableEntry {
                table_type: "rt".to_string(),
                path: "tests".to_string(),
            },
        );

        Self {
            short_name: short_name.to_string(),
            cluster_name,
            binary_port,
            doc: ManifestDoc { clusters, tables },
            store: Arc::new(NullStore),
            probes,
        }
    }

    pub fn doc(&self) -> &ManifestDoc {
        &self.doc
    }

    pub fn has_cluster(&self) -> bool {
        self.doc.clusters.contains_key(&self.cluster_name)
    }

    /// Persisted `host:port` node list, empty when absent.
    pub fn cluster_nodes(&self) -> Vec<String> {
        let Some(entry) = self.doc.clusters.get(&self.cluster_name) else {
            return Vec::new();
        };
        if entry.nodes.is_empty() {
            return Vec::new();
        }

        entry.nodes.split(',').map(|n| n.to_string()).collect()
    }

    /// Overwrite the persisted node CSV. An empty discovery result never
    /// clobbers good data; an unchanged list never touches the disk.
    pub fn update_nodes_list(&mut self, new_hosts: &[String]) -> Result<()> {
        if new_hosts.is_empty() {
            return Ok(());
        }

        let nodes = new_hosts.join(",");
        let entry = self.doc.clusters.entry(self.cluster_name.clone()).or_default();
        if entry.nodes == nodes {
            return Ok(());
        }

        entry.nodes = nodes;
        self.store.save(&self.doc)
    }

    /// Reconcile the persisted node list against live peers: keep the
    /// subset that answers with the right cluster identity, with the
    /// binary replication port appended. Peers that fail to answer are
    /// excluded silently — the caller's reconcile loop owns the retry.
    pub async fn check_nodes_availability(
        &mut self,
        tracker: &mut PodTracker,
        worker_port: u16,
        max_attempts: i32,
    ) -> Result<()> {
        let hostnames = tracker.full_hostnames().await?;

        let mut available = Vec::new();
        for host in hostnames {
            let mut probe = match self
                .probes
                .connect(&host, worker_port, &self.short_name, max_attempts)
                .await
            {
                Ok(probe) => probe,
                Err(error) => {
                    warn!(host = %host, error = %error, "peer unreachable");
                    continue;
                }
            };

            match probe.cluster_name_matches().await {
                Ok(true) => available.push(format!("{}:{}", host, self.binary_port)),
                Ok(false) => {}
                Err(error) => warn!(host = %host, error = %error, "peer identity check failed"),
            }
        }

        self.update_nodes_list(&available)
    }

    /// Whether every reachable peer reports non-primary state — the
    /// fully-downgraded cluster that needs a bootstrap restore.
    pub async fn is_all_nodes_non_primary(
        &mut self,
        tracker: &mut PodTracker,
        worker_port: u16,
    ) -> Result<bool> {
        for (name, ip) in tracker.pod_ips().await? {
            let mut probe = match self
                .probes
                .connect(&ip, worker_port, &self.short_name, 1)
                .await
            {
                Ok(probe) => probe,
                Err(error) => {
                    warn!(pod = %name, error = %error, "peer unreachable during primary check");
                    continue;
                }
            };

            if probe.is_primary().await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Re-register tables whose data directories exist on disk but which
    /// are missing from the document — healing a registry that lost track
    /// of tables still physically present after a crash.
    pub async fn restore_missing_tables(
        &mut self,
        specs: &[TableSpec],
        data_dir: &Path,
        notifier: &dyn Notifier,
    ) -> Result<()> {
        if self.doc.clusters.is_empty() && self.doc.tables.is_empty() {
            return Ok(());
        }

        let mut changed = false;
        for spec in specs {
            if self.doc.tables.contains_key(&spec.name) {
                continue;
            }
            if !data_dir.join(&spec.name).exists() {
                continue;
            }

            self.doc.tables.insert(
                spec.name.clone(),
                TableEntry {
                    table_type: spec.table_type.clone(),
                    path: spec.name.clone(),
                },
            );
            changed = true;

            info!(table = %spec.name, kind = %spec.table_type, "table was returned into the registry");
            notifier
                .send_message(&format!(
                    "Table {} ({}) was returned into the registry",
                    spec.name, spec.table_type
                ))
                .await;
        }

        if changed {
            self.store.save(&self.doc)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::engine::{EngineProbe, ThreadInfo};
    use crate::error::SentinelError;
    use crate::k8s::OrchestratorApi;
    use crate::k8s::PodList;
    use crate::notify::test_support::RecordingNotifier;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct MemoryStore {
        doc: Mutex<ManifestDoc>,
        saves: Mutex<usize>,
    }

    impl MemoryStore {
        fn with(doc: ManifestDoc) -> Arc<Self> {
            Arc::new(Self {
                doc: Mutex::new(doc),
                saves: Mutex::new(0),
            })
        }

        fn save_count(&self) -> usize {
            *self.saves.lock().unwrap()
        }
    }

    impl ManifestStore for MemoryStore {
        fn read(&self) -> Result<ManifestDoc> {
            Ok(self.doc.lock().unwrap().clone())
        }

        fn save(&self, doc: &ManifestDoc) -> Result<()> {
            *self.doc.lock().unwrap() = doc.clone();
            *self.saves.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct ScriptedProbe {
        answers: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl EngineProbe for ScriptedAnswer {
        async fn cluster_name_matches(&mut self) -> Result<bool> {
            Ok(self.answer)
        }

        async fn is_primary(&mut self) -> Result<bool> {
            Ok(self.answer)
        }

        async fn show_threads(&mut self) -> Result<Vec<ThreadInfo>> {
            Ok(Vec::new())
        }
    }

    struct ScriptedAnswer {
        answer: bool,
    }

    #[async_trait]
    impl ProbeFactory for ScriptedProbe {
        async fn connect(
            &self,
            _host: &str,
            _port: u16,
            _short_cluster_name: &str,
            _max_attempts: i32,
        ) -> Result<Box<dyn EngineProbe>> {
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                return Err(SentinelError::EngineUnreachable("scripted".into()));
            }
            Ok(Box::new(ScriptedAnswer {
                answer: answers.remove(0),
            }))
        }
    }

    fn probe_answers(answers: Vec<bool>) -> Arc<ScriptedProbe> {
        Arc::new(ScriptedProbe {
            answers: Mutex::new(answers),
        })
    }

    fn base_doc() -> ManifestDoc {
        serde_json::from_value(json!({
            "clusters": {
                "m_cluster": {
                    "nodes": "192.168.0.1:9312,92.168.0.1:9312",
                    "options": "",
                    "tables": ["pq", "tests"]
                }
            },
            "tables": {
                "pq": {"type": "percolate", "path": "pq"},
                "tests": {"type": "rt", "path": "tests"}
            }
        }))
        .unwrap()
    }

    fn manifest_with(doc: ManifestDoc, probes: Arc<ScriptedProbe>) -> (ClusterManifest, Arc<MemoryStore>) {
        let store = MemoryStore::with(doc);
        let manifest = ClusterManifest::load("m", 9312, store.clone(), probes).unwrap();
        (manifest, store)
    }

    struct StaticApi {
        listing: PodList,
    }

    #[async_trait]
    impl OrchestratorApi for StaticApi {
        async fn list_pods(&self, _labels: &BTreeMap<String, String>) -> Result<PodList> {
            Ok(self.listing.clone())
        }
    }

    struct StaticResolver;

    #[async_trait]
    impl crate::k8s::HostnameResolver for StaticResolver {
        fn own_hostname(&self) -> Result<String> {
            Ok("worker-0".to_string())
        }

        async fn resolve(&self, host: &str) -> Result<String> {
            Err(SentinelError::Hostname(host.to_string()))
        }
    }

    fn tracker_over(pods: serde_json::Value) -> PodTracker {
        let listing: PodList = serde_json::from_value(pods).unwrap();
        PodTracker::new(
            Arc::new(StaticApi { listing }),
            BTreeMap::new(),
            Arc::new(RecordingNotifier::default()),
            Arc::new(StaticResolver),
            Arc::new(ManualClock::new()),
            false,
        )
    }

    fn worker(ordinal: u32) -> serde_json::Value {
        json!({
            "metadata": {"name": format!("worker-{}", ordinal), "namespace": "search"},
            "spec": {"subdomain": "worker-svc"},
            "status": {
                "phase": "Running",
                "podIP": format!("10.42.0.{}", ordinal + 1),
                "conditions": [{"type": "Ready", "status": "True"}]
            }
        })
    }

    #[test]
    fn has_cluster_follows_the_document() {
        let (manifest, _) = manifest_with(base_doc(), probe_answers(vec![]));
        assert!(manifest.has_cluster());

        let (manifest, _) = manifest_with(ManifestDoc::default(), probe_answers(vec![]));
        assert!(!manifest.has_cluster());
    }

    #[test]
    fn cluster_nodes_parses_the_csv() {
        let (manifest, _) = manifest_with(base_doc(), probe_answers(vec![]));
        assert_eq!(
            manifest.cluster_nodes(),
            vec!["192.168.0.1:9312", "92.168.0.1:9312"]
        );

        let (manifest, _) = manifest_with(ManifestDoc::default(), probe_answers(vec![]));
        assert!(manifest.cluster_nodes().is_empty());
    }

    #[test]
    fn update_nodes_list_replaces_and_persists() {
        let (mut manifest, store) = manifest_with(base_doc(), probe_answers(vec![]));

        manifest
            .update_nodes_list(&[
                "hostname1.com:9306".to_string(),
                "hostname2.com:9306".to_string(),
            ])
            .unwrap();

        assert_eq!(
            manifest.doc().clusters["m_cluster"].nodes,
            "hostname1.com:9306,hostname2.com:9306"
        );
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn empty_node_list_never_clobbers_the_document() {
        let (mut manifest, store) = manifest_with(base_doc(), probe_answers(vec![]));

        manifest.update_nodes_list(&[]).unwrap();

        assert_eq!(manifest.doc(), &base_doc());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn unchanged_node_list_is_a_no_op() {
        let (mut manifest, store) = manifest_with(base_doc(), probe_answers(vec![]));

        manifest
            .update_nodes_list(&[
                "192.168.0.1:9312".to_string(),
                "92.168.0.1:9312".to_string(),
            ])
            .unwrap();

        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn availability_check_keeps_only_identity_matching_peers() {
        let (mut manifest, _) = manifest_with(base_doc(), probe_answers(vec![true, false, true]));
        let mut tracker = tracker_over(json!({"items": [worker(0), worker(1), worker(2)]}));

        manifest
            .check_nodes_availability(&mut tracker, 9306, 1)
            .await
            .unwrap();

        assert_eq!(
            manifest.doc().clusters["m_cluster"].nodes,
            "worker-0.worker-svc.search.svc.cluster.local:9312,\
             worker-2.worker-svc.search.svc.cluster.local:9312"
        );
    }

    #[tokio::test]
    async fn primary_consensus_detects_fully_downgraded_cluster() {
        let (mut manifest, _) = manifest_with(base_doc(), probe_answers(vec![true, true, true]));
        let mut tracker = tracker_over(json!({"items": [worker(0), worker(1), worker(2)]}));
        assert!(!manifest
            .is_all_nodes_non_primary(&mut tracker, 9306)
            .await
            .unwrap());

        let (mut manifest, _) = manifest_with(base_doc(), probe_answers(vec![false, false, false]));
        let mut tracker = tracker_over(json!({"items": [worker(0), worker(1), worker(2)]}));
        assert!(manifest
            .is_all_nodes_non_primary(&mut tracker, 9306)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn orphaned_table_directories_are_reregistered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pq")).unwrap();

        let mut doc = base_doc();
        doc.tables.remove("pq");
        let (mut manifest, store) = manifest_with(doc, probe_answers(vec![]));

        let notifier = RecordingNotifier::default();
        let specs = vec![
            TableSpec {
                name: "pq".to_string(),
                table_type: "percolate".to_string(),
            },
            TableSpec {
                name: "tests".to_string(),
                table_type: "rt".to_string(),
            },
        ];

        manifest
            .restore_missing_tables(&specs, dir.path(), &notifier)
            .await
            .unwrap();

        assert_eq!(
            manifest.doc().tables["pq"],
            TableEntry {
                table_type: "percolate".to_string(),
                path: "pq".to_string()
            }
        );
        assert_eq!(store.save_count(), 1);
        assert_eq!(notifier.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_directory_is_not_recovered() {
        let dir = tempfile::tempdir().unwrap();

        let mut doc = base_doc();
        doc.tables.remove("pq");
        let (mut manifest, store) = manifest_with(doc, probe_answers(vec![]));

        let notifier = RecordingNotifier::default();
        let specs = vec![TableSpec {
            name: "pq".to_string(),
            table_type: "percolate".to_string(),
        }];

        manifest
            .restore_missing_tables(&specs, dir.path(), &notifier)
            .await
            .unwrap();

        assert!(!manifest.doc().tables.contains_key("pq"));
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn development_document_matches_the_fixture_shape() {
        let manifest = ClusterManifest::development("m", 1000, probe_answers(vec![]));

        assert!(manifest.has_cluster());
        assert_eq!(
            manifest.cluster_nodes(),
            vec!["192.168.0.1:1000", "92.168.0.1:1000"]
        );
        assert_eq!(manifest.doc().tables["pq"].table_type, "percolate");
        assert_eq!(manifest.doc().tables["tests"].table_type, "rt");
    }
}
