//! Engine protocol layer.
//!
//! Everything the agent says to searchd goes over the MySQL-wire text
//! protocol as plain SQL strings. This module handles:
//! - Retrying query execution over a persistent connection
//! - Cluster membership operations (status, create/join/restore, tables)
//! - Batched table-to-table data migration

mod connector;
mod executor;
mod migrate;

pub use connector::{EngineConnector, ThreadInfo, DEFAULT_RT_INCLUDE};
pub use executor::{escape, MysqlEndpoint, QueryExecutor, SqlEndpoint, SqlRow};
pub use migrate::TableMigrator;

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::Result;

/// Subset of connector operations other components need against *remote*
/// peers: cluster identity checks for reconciliation, primary-state checks
/// for quorum-loss detection, thread listing for the optimize lock.
///
/// Injected as a factory so tests never dial a real engine.
#[async_trait]
pub trait EngineProbe: Send {
    async fn cluster_name_matches(&mut self) -> Result<bool>;
    async fn is_primary(&mut self) -> Result<bool>;
    async fn show_threads(&mut self) -> Result<Vec<ThreadInfo>>;
}

/// Opens probe connections to peer engines.
#[async_trait]
pub trait ProbeFactory: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        short_cluster_name: &str,
        max_attempts: i32,
    ) -> Result<Box<dyn EngineProbe>>;
}

/// Production factory dialing peers over the SQL protocol.
pub struct DialProbeFactory {
    binary_port: u16,
    clock: Arc<dyn Clock>,
}

impl DialProbeFactory {
    pub fn new(binary_port: u16, clock: Arc<dyn Clock>) -> Self {
        Self { binary_port, clock }
    }
}

#[async_trait]
impl ProbeFactory for DialProbeFactory {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        short_cluster_name: &str,
        max_attempts: i32,
    ) -> Result<Box<dyn EngineProbe>> {
        let connector = EngineConnector::connect(
            host,
            port,
            Some(short_cluster_name),
            max_attempts,
            self.binary_port,
            Arc::clone(&self.clock),
        )
        .await?;

        Ok(Box::new(connector))
    }
}
