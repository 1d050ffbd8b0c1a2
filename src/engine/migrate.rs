//! Batched table-to-table data migration.
//!
//! Used on schema-version upgrades to move rows between old and new table
//! layouts. A copy is never partially accepted: after all pages are
//! inserted, the destination row count must equal the source count taken
//! at the start, or the whole job is a hard failure.

use tracing::debug;

use crate::error::{Result, SentinelError};

use super::connector::EngineConnector;
use super::executor::{escape, SqlRow};

/// Copies and drops tables through an exclusive borrow of the connector.
pub struct TableMigrator<'a> {
    connector: &'a mut EngineConnector,
}

impl<'a> TableMigrator<'a> {
    pub fn new(connector: &'a mut EngineConnector) -> Self {
        Self { connector }
    }

    /// Copy all rows from `src` to `dst` in pages of `batch`, ordered by
    /// primary id. With `in_cluster` the destination is cluster-qualified.
    ///
    /// An empty source succeeds trivially without issuing a single fetch.
    pub async fn copy(&mut self, src: &str, dst: &str, batch: u64, in_cluster: bool) -> Result<()> {
        let total = self.count(src).await?;
        if total == 0 {
            return Ok(());
        }

        let pages = total.div_ceil(batch);
        let mut offset = 0;
        for page in 0..pages {
            let rows = self.rows(src, batch, offset).await?;
            self.insert_rows(dst, &rows, in_cluster).await?;
            offset += batch;

            debug!(
                src,
                dst,
                percent = (page + 1) * 100 / pages,
                "copy progress"
            );
        }

        let copied = self.count(dst).await?;
        if copied != total {
            return Err(SentinelError::CountMismatch {
                src: src.to_string(),
                dst: dst.to_string(),
                src_count: total,
                dst_count: copied,
            });
        }

        Ok(())
    }

    /// Drop a table, detaching it from the replication cluster first when
    /// `in_cluster`. Both steps raise on failure — a half-dropped table is
    /// not a state the reconcile loop can converge from.
    pub async fn drop(&mut self, table: &str, in_cluster: bool) -> Result<()> {
        if in_cluster {
            let statement = format!(
                "ALTER CLUSTER {} DROP {}",
                self.connector.cluster_name(),
                table
            );
            self.connector
                .executor_mut()
                .execute(&statement, true)
                .await
                .map_err(|e| SentinelError::ClusterDetachFailed {
                    table: table.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let statement = format!("DROP TABLE {}", table);
        self.connector
            .executor_mut()
            .execute(&statement, true)
            .await
            .map_err(|e| SentinelError::DropFailed {
                table: table.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn count(&mut self, table: &str) -> Result<u64> {
        let statement = format!("SELECT count(*) as cnt FROM {}", table);
        let rows = self.connector.executor_mut().fetch(&statement, true).await?;

        rows.as_deref()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("cnt"))
            .and_then(|cnt| cnt.parse().ok())
            .ok_or_else(|| SentinelError::CountUnavailable {
                table: table.to_string(),
                reason: "no count row returned".to_string(),
            })
    }

    async fn rows(&mut self, table: &str, limit: u64, offset: u64) -> Result<Vec<SqlRow>> {
        let statement = format!(
            "SELECT * FROM {} ORDER BY id ASC limit {} offset {}",
            table, limit, offset
        );
        Ok(self
            .connector
            .executor_mut()
            .fetch(&statement, true)
            .await?
            .unwrap_or_default())
    }

    /// One multi-row INSERT for a whole page. All rows of a page must
    /// share the first row's column set; a divergent row is an invariant
    /// violation rather than a silently misaligned insert.
    async fn insert_rows(&mut self, table: &str, rows: &[SqlRow], in_cluster: bool) -> Result<bool> {
        let Some(first) = rows.first() else {
            return Ok(false);
        };

        let columns: Vec<&str> = first.columns().collect();
        let mut tuples = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.columns().collect::<Vec<_>>() != columns {
                return Err(SentinelError::RowShapeMismatch { row: i });
            }

            let values: Vec<String> = row.values().map(|v| format!("'{}'", escape(v))).collect();
            tuples.push(values.join(", "));
        }

        let qualified = if in_cluster {
            format!("{}:{}", self.connector.cluster_name(), table)
        } else {
            table.to_string()
        };

        let statement = format!(
            "INSERT INTO {} (`{}`) VALUES ({})",
            qualified,
            columns.join("`,`"),
            tuples.join("),(")
        );

        self.connector.executor_mut().execute(&statement, false).await?;
        Ok(true)
    }
}
