//! End-to-end reconciliation over fake collaborators: discovery feeds the
//! manifest, the manifest probes peers and persists the surviving node
//! list, quorum loss is detected across the same peer set.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use sentinel::clock::Clock;
use sentinel::config::TableSpec;
use sentinel::engine::{EngineProbe, ProbeFactory, ThreadInfo};
use sentinel::k8s::{HostnameResolver, OrchestratorApi, PodList, PodTracker};
use sentinel::manifest::{ClusterManifest, FileManifestStore, ManifestStore};
use sentinel::notify::Notifier;
use sentinel::{Result, SentinelError};

struct InstantClock;

#[async_trait]
impl Clock for InstantClock {
    async fn sleep(&self, _duration: Duration) {}

    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct SilentNotifier;

#[async_trait]
impl Notifier for SilentNotifier {
    async fn send_message(&self, _message: &str) -> bool {
        true
    }
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
impl HostnameResolver for StaticResolver {
    fn own_hostname(&self) -> Result<String> {
        Ok("worker-0".to_string())
    }

    async fn resolve(&self, host: &str) -> Result<String> {
        Err(SentinelError::Hostname(host.to_string()))
    }
}

/// Probe whose answers are scripted per connection, in call order.
struct ScriptedProbes {
    answers: Mutex<Vec<bool>>,
    hosts: Mutex<Vec<String>>,
}

struct OneAnswer {
    answer: bool,
}

#[async_trait]
impl EngineProbe for OneAnswer {
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

#[async_trait]
impl ProbeFactory for ScriptedProbes {
    async fn connect(
        &self,
        host: &str,
        _port: u16,
        _short_cluster_name: &str,
        _max_attempts: i32,
    ) -> Result<Box<dyn EngineProbe>> {
        self.hosts.lock().unwrap().push(host.to_string());

        let mut answers = self.answers.lock().unwrap();
        if answers.is_empty() {
            return Err(SentinelError::EngineUnreachable(host.to_string()));
        }
        Ok(Box::new(OneAnswer {
            answer: answers.remove(0),
        }))
    }
}

fn probes(answers: Vec<bool>) -> Arc<ScriptedProbes> {
    Arc::new(ScriptedProbes {
        answers: Mutex::new(answers),
        hosts: Mutex::new(Vec::new()),
    })
}

fn three_worker_listing() -> PodList {
    let items: Vec<serde_json::Value> = (0..3)
        .map(|i| {
            json!({
                "metadata": {"name": format!("worker-{}", i), "namespace": "search"},
                "spec": {"subdomain": "worker-svc"},
                "status": {
                    "phase": "Running",
                    "podIP": format!("10.42.0.{}", i + 1),
                    "startTime": format!("2024-05-01T0{}:00:00Z", i),
                    "conditions": [{"type": "Ready", "status": "True"}]
                }
            })
        })
        .collect();

    serde_json::from_value(json!({ "items": items })).unwrap()
}

fn tracker() -> PodTracker {
    PodTracker::new(
        Arc::new(StaticApi {
            listing: three_worker_listing(),
        }),
        BTreeMap::new(),
        Arc::new(SilentNotifier),
        Arc::new(StaticResolver),
        Arc::new(InstantClock),
        false,
    )
}

fn seed_manifest(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("searchd.json");
    std::fs::write(
        &path,
        json!({
            "clusters": {
                "m_cluster": {
                    "nodes": "stale-node:9312",
                    "options": "",
                    "tables": ["pq", "tests"]
                }
            },
            "tables": {
                "tests": {"type": "rt", "path": "tests"}
            }
        })
        .to_string(),
    )
    .unwrap();
    path
}

#[tokio::test]
async fn discovered_peers_replace_the_stale_node_list_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = seed_manifest(dir.path());

    let factory = probes(vec![true, false, true]);
    let store = Arc::new(FileManifestStore::new(&path));
    let mut manifest = ClusterManifest::load("m", 9312, store.clone(), factory.clone()).unwrap();
    let mut tracker = tracker();

    manifest
        .check_nodes_availability(&mut tracker, 9306, 1)
        .await
        .unwrap();

    // worker-1 answered with the wrong identity and is excluded.
    let persisted = store.read().unwrap();
    assert_eq!(
        persisted.clusters["m_cluster"].nodes,
        "worker-0.worker-svc.search.svc.cluster.local:9312,\
         worker-2.worker-svc.search.svc.cluster.local:9312"
    );

    // Probes were dialed at the discovered FQDNs.
    let hosts = factory.hosts.lock().unwrap();
    assert_eq!(hosts.len(), 3);
    assert!(hosts[0].starts_with("worker-0."));
}

#[tokio::test]
async fn quorum_loss_is_judged_across_every_discovered_peer() {
    let dir = tempfile::tempdir().unwrap();
    let path = seed_manifest(dir.path());

    let factory = probes(vec![false, false, false]);
    let mut manifest =
        ClusterManifest::load("m", 9312, Arc::new(FileManifestStore::new(&path)), factory).unwrap();
    let mut tracker1 = tracker();

    assert!(manifest
        .is_all_nodes_non_primary(&mut tracker1, 9306)
        .await
        .unwrap());

    let factory = probes(vec![false, true, false]);
    let mut manifest =
        ClusterManifest::load("m", 9312, Arc::new(FileManifestStore::new(&path)), factory).unwrap();
    let mut tracker = tracker();

    assert!(!manifest
        .is_all_nodes_non_primary(&mut tracker, 9306)
        .await
        .unwrap());
}

#[tokio::test]
async fn orphaned_table_recovery_persists_through_the_real_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = seed_manifest(dir.path());
    std::fs::create_dir(dir.path().join("pq")).unwrap();

    let store = Arc::new(FileManifestStore::new(&path));
    let mut manifest =
        ClusterManifest::load("m", 9312, store.clone(), probes(vec![])).unwrap();

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
        .restore_missing_tables(&specs, dir.path(), &SilentNotifier)
        .await
        .unwrap();

    let persisted = store.read().unwrap();
    assert_eq!(persisted.tables["pq"].table_type, "percolate");
    assert_eq!(persisted.tables["pq"].path, "pq");
    // The table that was never on disk stays unregistered.
    assert_eq!(persisted.tables.len(), 2);
}
