//! Peer discovery and cluster facts.
//!
//! [`PodTracker`] turns raw pod listings into the facts the reconcile
//! loop steers by: the live peer set, IP and hostname maps, the oldest
//! pod, the deterministic bootstrap leader, this node's replica ordinal.
//! The peer set is rebuilt fully on every listing and memoized on the
//! tracker until explicitly reset.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::clock::Clock;
use crate::error::{Result, SentinelError};
use crate::notify::Notifier;

use super::api::OrchestratorApi;
use super::pod::Pod;

/// Self-identity and DNS lookup capability.
#[async_trait]
pub trait HostnameResolver: Send + Sync {
    /// This pod's own hostname.
    fn own_hostname(&self) -> Result<String>;

    /// Resolve a hostname to an IP address.
    async fn resolve(&self, host: &str) -> Result<String>;
}

/// Production resolver: `HOSTNAME` from the environment (set by the
/// orchestrator), DNS through the runtime's lookup.
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostnameResolver for SystemResolver {
    fn own_hostname(&self) -> Result<String> {
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            if !hostname.is_empty() {
                return Ok(hostname);
            }
        }

        std::fs::read_to_string("/etc/hostname")
            .map(|h| h.trim().to_string())
            .map_err(|e| SentinelError::Hostname(e.to_string()))
    }

    async fn resolve(&self, host: &str) -> Result<String> {
        let mut addrs = tokio::net::lookup_host((host, 0u16))
            .await
            .map_err(|e| SentinelError::Hostname(format!("{}: {}", host, e)))?;

        addrs
            .next()
            .map(|addr| addr.ip().to_string())
            .ok_or_else(|| SentinelError::Hostname(format!("{}: no addresses", host)))
    }
}

/// Tracks peer pods matching a label selector.
pub struct PodTracker {
    api: Arc<dyn OrchestratorApi>,
    labels: BTreeMap<String, String>,
    notifier: Arc<dyn Notifier>,
    resolver: Arc<dyn HostnameResolver>,
    clock: Arc<dyn Clock>,
    dev_mode: bool,
    pods: Option<Vec<Pod>>,
}

impl PodTracker {
    pub fn new(
        api: Arc<dyn OrchestratorApi>,
        labels: BTreeMap<String, String>,
        notifier: Arc<dyn Notifier>,
        resolver: Arc<dyn HostnameResolver>,
        clock: Arc<dyn Clock>,
        dev_mode: bool,
    ) -> Self {
        Self {
            api,
            labels,
            notifier,
            resolver,
            clock,
            dev_mode,
            pods: None,
        }
    }

    /// Drop the memoized peer set; the next query lists pods again.
    pub fn reset(&mut self) {
        self.pods = None;
    }

    /// The filtered peer set: Running/Pending pods that are Ready when
    /// they report conditions at all. Skipped pods trigger a notification.
    ///
    /// A listing without an `items` array is structurally invalid — the
    /// caller's reconcile loop owns the retry, not this layer.
    pub async fn pods(&mut self) -> Result<&[Pod]> {
        if self.pods.is_none() {
            let listing = self.api.list_pods(&self.labels).await?;
            let Some(items) = listing.items else {
                warn!("orchestrator API didn't respond with pod items");
                return Err(SentinelError::MalformedPodList);
            };

            let mut accepted = Vec::with_capacity(items.len());
            for pod in items {
                if pod.is_accepted() {
                    accepted.push(pod);
                } else {
                    warn!(pod = %pod.metadata.name, phase = %pod.status.phase, "bad pod phase");
                    self.notifier
                        .send_message(&format!(
                            "Bad pod phase for {} phase {}",
                            pod.metadata.name, pod.status.phase
                        ))
                        .await;
                }
            }

            self.pods = Some(accepted);
        }

        Ok(self.pods.as_deref().unwrap_or_default())
    }

    pub async fn active_count(&mut self) -> Result<usize> {
        Ok(self.pods().await?.len())
    }

    /// Name of the pod with the minimum start time, optionally excluding
    /// self. Used to pick the join seed among the longest-lived peers.
    pub async fn oldest_pod_name(&mut self, skip_self: bool) -> Result<String> {
        let own = self.resolver.own_hostname()?;

        let mut by_start_time: BTreeMap<DateTime<Utc>, String> = BTreeMap::new();
        for pod in self.pods().await? {
            if skip_self && pod.metadata.name == own {
                continue;
            }
            if let Some(start_time) = pod.status.start_time {
                by_start_time.insert(start_time, pod.metadata.name.clone());
            }
        }

        by_start_time
            .into_values()
            .next()
            .ok_or(SentinelError::NoJoinablePeer)
    }

    /// Name → IP for the live peer set. A pod that is self but has no
    /// assigned IP yet is resolved through DNS — the "I know who I am but
    /// the orchestrator hasn't told anyone" bootstrap case.
    pub async fn pod_ips(&mut self) -> Result<BTreeMap<String, String>> {
        if self.dev_mode {
            return Ok(BTreeMap::new());
        }

        let own = self.resolver.own_hostname()?;
        let pods: Vec<Pod> = self.pods().await?.to_vec();

        let mut ips = BTreeMap::new();
        for pod in pods {
            if !pod.is_running_or_pending() {
                continue;
            }

            if let Some(ip) = &pod.status.pod_ip {
                ips.insert(pod.metadata.name.clone(), ip.clone());
            } else if pod.metadata.name == own {
                match self.resolver.resolve(&own).await {
                    Ok(ip) => {
                        ips.insert(own.clone(), ip);
                    }
                    Err(error) => warn!(error = %error, "self IP resolution failed"),
                }
            }
        }

        Ok(ips)
    }

    pub async fn hostnames(&mut self) -> Result<Vec<String>> {
        if self.dev_mode {
            return Ok(Vec::new());
        }

        Ok(self
            .pods()
            .await?
            .iter()
            .filter(|pod| pod.is_running_or_pending())
            .map(|pod| pod.metadata.name.clone())
            .collect())
    }

    /// Cluster-internal FQDNs: `<name>.<subdomain>.<namespace>.svc.cluster.local`.
    pub async fn full_hostnames(&mut self) -> Result<Vec<String>> {
        if self.dev_mode {
            return Ok(Vec::new());
        }

        Ok(self
            .pods()
            .await?
            .iter()
            .filter(|pod| pod.is_running_or_pending())
            .filter_map(|pod| {
                pod.spec.subdomain.as_ref().map(|subdomain| {
                    format!(
                        "{}.{}.{}.svc.cluster.local",
                        pod.metadata.name, subdomain, pod.metadata.namespace
                    )
                })
            })
            .collect())
    }

    /// Deterministic bootstrap leader: the lexicographically smallest
    /// hostname, optionally skipping self. No external consensus needed —
    /// every peer computes the same answer.
    pub async fn min_available_hostname(&mut self, skip_self: bool) -> Result<String> {
        let mut hostnames = self.hostnames().await?;
        if hostnames.is_empty() {
            return Err(SentinelError::NoAvailableNodes);
        }

        hostnames.sort();

        let own = self.resolver.own_hostname()?;
        hostnames
            .into_iter()
            .find(|name| !(skip_self && *name == own))
            .ok_or(SentinelError::NoAvailableNodes)
    }

    /// The replica-0 sibling name derived from self's ordinal-suffixed
    /// hostname.
    pub fn min_replica_name(&self) -> Result<String> {
        let own = self.resolver.own_hostname()?;

        let mut parts: Vec<&str> = own.split('-').collect();
        parts.pop();
        parts.push("0");
        Ok(parts.join("-"))
    }

    /// Numeric suffix of self's hostname.
    pub fn current_ordinal(&self) -> Result<u32> {
        if self.dev_mode {
            return Ok(0);
        }

        let own = self.resolver.own_hostname()?;
        Ok(own
            .rsplit('-')
            .next()
            .and_then(|suffix| suffix.parse().ok())
            .unwrap_or(0))
    }

    /// Name → IP for every non-terminating pod regardless of readiness —
    /// the stricter "is anyone out there at all" check. Pods with a
    /// deletion timestamp or without an IP are excluded.
    pub async fn all_pod_ips_ignoring_readiness(&mut self) -> Result<BTreeMap<String, String>> {
        let listing = self.api.list_pods(&self.labels).await?;
        let Some(items) = listing.items else {
            warn!("orchestrator API didn't respond with pod items");
            return Err(SentinelError::MalformedPodList);
        };

        let mut ips = BTreeMap::new();
        for pod in items {
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            if let Some(ip) = pod.status.pod_ip {
                ips.insert(pod.metadata.name, ip);
            }
        }

        Ok(ips)
    }

    /// Poll once per second until the named peer is ready or the timeout
    /// elapses. Blocking by design — one agent process per node, waiting
    /// is its job.
    pub async fn wait_ready(&mut self, pod_name: &str, timeout: Duration) -> Result<bool> {
        let start = self.clock.now();

        loop {
            if self.clock.now().duration_since(start) > timeout {
                return Ok(false);
            }

            match self.pods().await {
                Ok(pods) => {
                    if pods
                        .iter()
                        .any(|pod| pod.metadata.name == pod_name && pod.is_ready())
                    {
                        return Ok(true);
                    }
                }
                Err(error) => warn!(error = %error, "pod listing failed while waiting"),
            }

            self.clock.sleep(Duration::from_secs(1)).await;
            self.reset();
        }
    }
}
