//! Top-level reconcile and maintenance ticks.
//!
//! This is the only layer that wires real collaborators together and the
//! only layer allowed to turn a fatal error into a process exit (which it
//! delegates to `main`). Each tick runs once; the surrounding process —
//! one agent per pod — provides the retry cadence.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::cache::{StateCache, TABLE_HASH};
use crate::clock::{Clock, SystemClock};
use crate::config::AgentConfig;
use crate::engine::{DialProbeFactory, EngineConnector, ProbeFactory, TableMigrator};
use crate::error::{Result, SentinelError};
use crate::k8s::{HostnameResolver, K8sApiClient, OrchestratorApi, PodTracker, SystemResolver};
use crate::locker::Locker;
use crate::manifest::{ClusterManifest, FileManifestStore};
use crate::notify::{NotificationStub, Notifier, WebhookNotifier};

/// Rows per page during schema-upgrade copies.
const MIGRATION_BATCH: u64 = 10_000;

/// One agent process: configuration plus its injected collaborators.
pub struct Agent {
    config: AgentConfig,
    api: Arc<dyn OrchestratorApi>,
    notifier: Arc<dyn Notifier>,
    resolver: Arc<dyn HostnameResolver>,
    probes: Arc<dyn ProbeFactory>,
    clock: Arc<dyn Clock>,
}

impl Agent {
    /// Wire the production collaborators.
    pub fn production(config: AgentConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let notifier: Arc<dyn Notifier> =
            match (&config.notify.chat_id, &config.notify.token) {
                (Some(chat_id), Some(token)) => Arc::new(WebhookNotifier::new(chat_id, token)),
                _ => Arc::new(NotificationStub),
            };

        Ok(Self {
            api: Arc::new(K8sApiClient::new()?),
            notifier,
            resolver: Arc::new(SystemResolver),
            probes: Arc::new(DialProbeFactory::new(
                config.engine.binary_port,
                Arc::clone(&clock),
            )),
            clock,
            config,
        })
    }

    fn tracker(&self) -> PodTracker {
        PodTracker::new(
            Arc::clone(&self.api),
            self.config.discovery.labels.clone(),
            Arc::clone(&self.notifier),
            Arc::clone(&self.resolver),
            Arc::clone(&self.clock),
            self.config.dev_mode,
        )
    }

    async fn connector(&self) -> Result<EngineConnector> {
        let mut connector = EngineConnector::connect(
            &self.config.engine.host,
            self.config.engine.worker_port,
            Some(&self.config.engine.cluster_name),
            self.config.engine.max_attempts,
            self.config.engine.binary_port,
            Arc::clone(&self.clock),
        )
        .await?;

        connector.set_rt_include_path(&self.config.paths.rt_include_path);
        if let Some(rules) = &self.config.engine.field_rules {
            connector.set_field_rules(rules)?;
        }

        Ok(connector)
    }

    fn manifest(&self) -> Result<ClusterManifest> {
        if self.config.dev_mode {
            return Ok(ClusterManifest::development(
                &self.config.engine.cluster_name,
                self.config.engine.binary_port,
                Arc::clone(&self.probes),
            ));
        }

        ClusterManifest::load(
            &self.config.engine.cluster_name,
            self.config.engine.binary_port,
            Arc::new(FileManifestStore::new(&self.config.paths.manifest_path)),
            Arc::clone(&self.probes),
        )
    }

    fn locker(&self, role: &str) -> Locker {
        let mut locker = Locker::new(
            role,
            &self.config.paths.lock_dir,
            self.config.paths.optimize_lock_path.clone(),
            Arc::clone(&self.probes),
            Arc::clone(&self.clock),
        );
        locker.set_probe_attempts(self.config.engine.max_attempts);
        locker
    }

    /// One reconcile pass: converge the engine-level cluster towards the
    /// discovered peer set and reconcile the persisted node list.
    pub async fn reconcile(&self) -> Result<()> {
        let mut locker = self.locker("replica");
        locker.acquire()?;

        let mut tracker = self.tracker();
        let mut manifest = self.manifest()?;

        manifest
            .restore_missing_tables(
                &self.config.tables,
                &self.config.paths.data_dir,
                self.notifier.as_ref(),
            )
            .await?;

        let peers = tracker.active_count().await?;
        info!(peers, "peer discovery finished");

        let mut connector = self.connector().await?;
        self.apply_schema_upgrade(&mut connector).await?;

        let ordinal = tracker.current_ordinal()?;
        if ordinal == 0 {
            // The fixed-identity first replica bootstraps the cluster.
            if manifest.has_cluster()
                && manifest
                    .is_all_nodes_non_primary(&mut tracker, self.config.engine.worker_port)
                    .await?
            {
                warn!("no peer reports primary state, bootstrapping a new primary");
                self.notifier
                    .send_message("Cluster lost quorum, restoring through pc.bootstrap")
                    .await;
                connector.restore_cluster(true).await?;
            }

            if !connector.ensure_schema(&self.config.tables).await? {
                warn!("schema convergence incomplete, retrying next tick");
            }
        } else {
            let seed = tracker.min_available_hostname(true).await?;

            let timeout = Duration::from_secs(self.config.discovery.peer_wait_timeout_secs);
            if !tracker.wait_ready(&seed, timeout).await? {
                warn!(seed = %seed, "bootstrap peer never became ready");
                return Err(SentinelError::NoJoinablePeer);
            }

            let seed_host = self.qualified_hostname(&mut tracker, &seed).await?;
            if connector.join_cluster(&seed_host, true).await? {
                info!(seed = %seed_host, "joined cluster");
            } else {
                warn!(seed = %seed_host, "join failed, retrying next tick");
            }
        }

        manifest
            .check_nodes_availability(
                &mut tracker,
                self.config.engine.worker_port,
                self.config.engine.max_attempts,
            )
            .await?;

        locker.unlock(Duration::ZERO).await
    }

    /// One maintenance pass: compact the first managed rt table whose
    /// chunk count crossed the threshold, provided no other peer is
    /// already running an optimize.
    pub async fn optimize_tick(&self) -> Result<()> {
        let mut locker = self.locker("optimize");
        locker.acquire()?;

        let artifact = self
            .config
            .paths
            .optimize_lock_path
            .clone()
            .ok_or(SentinelError::OptimizePathMissing)?;

        if locker
            .check_optimize_lock(&artifact, self.config.engine.worker_port)
            .await?
        {
            info!("optimize already running elsewhere in the fleet");
            return locker.unlock(Duration::ZERO).await;
        }

        let mut tracker = self.tracker();
        let mut connector = self.connector().await?;

        for table in connector.tables(true, Some(&["rt"])).await? {
            let chunks = connector.chunk_count(&table, true).await?;
            if chunks <= self.config.optimize.chunk_threshold {
                continue;
            }

            let own_ip = self.own_ip(&mut tracker).await?;
            locker.set_optimize_lock(&own_ip)?;

            info!(table = %table, chunks, "starting optimize");
            connector
                .optimize(&table, self.config.optimize.cutoff)
                .await?;

            // One optimize at a time fleet-wide.
            break;
        }

        locker.unlock(Duration::ZERO).await
    }

    /// Rebuild managed tables when the configured field rules changed
    /// since the last applied schema.
    ///
    /// Each table is copied out to a scratch table, dropped, recreated
    /// with the new columns and copied back — the copy verifies row
    /// counts at both hops, so a failed upgrade dies loudly instead of
    /// dropping rows.
    async fn apply_schema_upgrade(&self, connector: &mut EngineConnector) -> Result<()> {
        let Some(rules) = &self.config.engine.field_rules else {
            return Ok(());
        };

        let mut cache = StateCache::open(&self.config.paths.cache_path);
        let applied = cache.get(TABLE_HASH);
        if applied == json!(rules) {
            return Ok(());
        }

        if !applied.is_null() && connector.cluster_name_matches().await? {
            for spec in &self.config.tables {
                if !connector.table_exists(&spec.name).await? {
                    continue;
                }

                let scratch = format!("{}_new", spec.name);
                info!(table = %spec.name, "rebuilding table for new schema");

                if !connector.create_table(&scratch, &spec.table_type).await? {
                    warn!(table = %spec.name, "scratch table creation failed, retrying next tick");
                    continue;
                }
                let mut migrator = TableMigrator::new(connector);
                migrator.copy(&spec.name, &scratch, MIGRATION_BATCH, false).await?;
                migrator.drop(&spec.name, true).await?;

                if !connector.create_table(&spec.name, &spec.table_type).await? {
                    return Err(SentinelError::DropFailed {
                        table: spec.name.clone(),
                        reason: "table was dropped but couldn't be recreated".to_string(),
                    });
                }
                connector.add_table_to_cluster(&spec.name, true).await?;

                let mut migrator = TableMigrator::new(connector);
                migrator.copy(&scratch, &spec.name, MIGRATION_BATCH, true).await?;
                migrator.drop(&scratch, false).await?;

                self.notifier
                    .send_message(&format!("Table {} was rebuilt for the new schema", spec.name))
                    .await;
            }
        }

        cache.store(TABLE_HASH, json!(rules))?;
        Ok(())
    }

    async fn own_ip(&self, tracker: &mut PodTracker) -> Result<String> {
        let own = self.resolver.own_hostname()?;

        if let Some(ip) = tracker.pod_ips().await?.get(&own) {
            return Ok(ip.clone());
        }

        self.resolver.resolve(&own).await
    }

    /// The FQDN for a discovered pod name, falling back to the bare name
    /// when the pod carries no subdomain.
    async fn qualified_hostname(
        &self,
        tracker: &mut PodTracker,
        pod_name: &str,
    ) -> Result<String> {
        let prefix = format!("{}.", pod_name);
        Ok(tracker
            .full_hostnames()
            .await?
            .into_iter()
            .find(|fqdn| fqdn.starts_with(&prefix))
            .unwrap_or_else(|| pod_name.to_string()))
    }
}
