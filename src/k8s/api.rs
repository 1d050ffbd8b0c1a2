//! In-cluster orchestrator API client.
//!
//! Treated as a black box by the membership logic: given a label selector
//! it returns the namespace-scoped pod list document. Bearer token and
//! namespace come from the well-known serviceaccount mount.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, SentinelError};

use super::pod::PodList;

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const API_BASE: &str = "https://kubernetes.default.svc";

/// Pod listing capability, injected into the tracker.
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    async fn list_pods(&self, labels: &BTreeMap<String, String>) -> Result<PodList>;
}

/// Production client using in-cluster HTTPS with bearer-token auth.
pub struct K8sApiClient {
    http: reqwest::Client,
    api_base: String,
    token_path: PathBuf,
    namespace_path: PathBuf,
}

impl K8sApiClient {
    pub fn new() -> Result<Self> {
        // The in-cluster CA is not in the system trust store.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| SentinelError::OrchestratorRequest(e.to_string()))?;

        Ok(Self {
            http,
            api_base: API_BASE.to_string(),
            token_path: PathBuf::from(TOKEN_PATH),
            namespace_path: PathBuf::from(NAMESPACE_PATH),
        })
    }

    fn bearer(&self) -> Option<String> {
        std::fs::read_to_string(&self.token_path)
            .ok()
            .map(|token| token.trim().to_string())
    }

    fn namespace(&self) -> Option<String> {
        std::fs::read_to_string(&self.namespace_path)
            .ok()
            .map(|ns| ns.trim().to_string())
    }
}

#[async_trait]
impl OrchestratorApi for K8sApiClient {
    async fn list_pods(&self, labels: &BTreeMap<String, String>) -> Result<PodList> {
        let namespace = self.namespace().ok_or_else(|| {
            SentinelError::OrchestratorRequest("serviceaccount namespace is not readable".into())
        })?;

        let selector = labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(",");

        let url = format!("{}/api/v1/namespaces/{}/pods", self.api_base, namespace);
        debug!(url = %url, selector = %selector, "listing pods");

        let mut request = self.http.get(&url).query(&[("labelSelector", selector)]);
        if let Some(token) = self.bearer() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SentinelError::OrchestratorRequest(e.to_string()))?;

        response
            .json::<PodList>()
            .await
            .map_err(|e| SentinelError::OrchestratorRequest(e.to_string()))
    }
}
