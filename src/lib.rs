//! # searchd-sentinel
//!
//! Control-plane core of a sidecar agent managing a replicated searchd
//! cluster under Kubernetes. One agent runs next to every engine pod and
//! steers it towards the fleet consensus:
//!
//! - **Peer discovery**: live pods matching a label selector, filtered by
//!   phase and readiness, turned into cluster facts (IPs, hostnames,
//!   bootstrap leader, replica ordinal)
//! - **Cluster lifecycle**: create/join/restore the engine-level
//!   replication cluster, attach managed tables, detect quorum loss
//! - **Registry reconciliation**: the persisted cluster document merged
//!   against live discovery, orphaned tables recovered
//! - **Table migration**: batched, count-verified copies between table
//!   layouts on schema upgrades
//! - **Fleet-wide mutual exclusion**: filesystem locks plus a live-state
//!   verified optimize claim, so the expensive compaction never runs on
//!   two nodes at once
//!
//! Everything is single-connection, synchronous in structure, and blocking
//! by design: waiting is sleep-and-retry on the calling task, and true
//! concurrency comes from running one agent per pod.

pub mod agent;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod k8s;
pub mod locker;
pub mod manifest;
pub mod notify;

mod error;

pub use error::{Result, SentinelError};
