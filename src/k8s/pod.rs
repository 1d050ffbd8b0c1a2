//! Read-only pod snapshot model.
//!
//! Pods are owned by the orchestrator; this agent only decodes the fields
//! it steers by. Unknown fields are ignored wholesale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level pod list response. A response without `items` is structurally
/// invalid and treated as fatal by the tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Option<Vec<Pod>>,
}

/// One pod snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: PodMetadata,
    pub spec: PodSpec,
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodMetadata {
    pub name: String,
    pub namespace: String,
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodSpec {
    pub subdomain: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    pub phase: String,
    pub conditions: Option<Vec<PodCondition>>,
    pub pod_ip: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

impl Pod {
    pub fn is_running_or_pending(&self) -> bool {
        self.status.phase == "Running" || self.status.phase == "Pending"
    }

    fn has_ready_condition(&self) -> bool {
        self.status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.condition_type == "Ready" && c.status == "True")
    }

    /// Discovery filter: acceptable phase, and when a conditions list is
    /// present at all, a true Ready condition. Pods without conditions are
    /// accepted by phase alone.
    pub fn is_accepted(&self) -> bool {
        if !self.is_running_or_pending() {
            return false;
        }

        match self.status.conditions.as_deref() {
            None | Some([]) => true,
            Some(_) => self.has_ready_condition(),
        }
    }

    /// Strict readiness used by the wait loop: a conditions list with a
    /// true Ready entry is required.
    pub fn is_ready(&self) -> bool {
        self.is_running_or_pending() && self.has_ready_condition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn acceptance_follows_phase_and_conditions() {
        let running_ready = pod(json!({
            "metadata": {"name": "worker-0"},
            "status": {
                "phase": "Running",
                "conditions": [{"type": "Ready", "status": "True"}]
            }
        }));
        assert!(running_ready.is_accepted());
        assert!(running_ready.is_ready());

        let pending_no_conditions = pod(json!({
            "metadata": {"name": "worker-1"},
            "status": {"phase": "Pending"}
        }));
        assert!(pending_no_conditions.is_accepted());
        assert!(!pending_no_conditions.is_ready());

        let running_unready = pod(json!({
            "metadata": {"name": "worker-2"},
            "status": {
                "phase": "Running",
                "conditions": [{"type": "Ready", "status": "False"}]
            }
        }));
        assert!(!running_unready.is_accepted());

        let failed = pod(json!({
            "metadata": {"name": "worker-3"},
            "status": {"phase": "Failed"}
        }));
        assert!(!failed.is_accepted());
    }

    #[test]
    fn start_time_parses_rfc3339() {
        let p = pod(json!({
            "metadata": {"name": "worker-0"},
            "status": {"phase": "Running", "startTime": "2024-05-01T10:00:00Z"}
        }));
        assert!(p.status.start_time.is_some());
    }
}
