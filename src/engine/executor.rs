//! Retrying query execution against the engine.
//!
//! The single SQL connection is owned exclusively by one executor; callers
//! serialize on it. A query that fails (transport error or engine error)
//! is retried with a fixed 1-second backoff up to the configured bound —
//! the engine may be mid-restart and the agent's job is to wait it out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Value};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Result, SentinelError};

/// Effective bound for "retry indefinitely" (negative configured value).
const RETRY_FOREVER: u32 = 999_999;

/// One result row: column name / value pairs in wire order.
///
/// Values are kept as text — the protocol is textual and the agent embeds
/// them back into textual SQL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlRow {
    cells: Vec<(String, String)>,
}

impl SqlRow {
    pub fn new() -> Self {
        Self { cells: Vec::new() }
    }

    /// Build a row from pairs, mostly useful in tests and fixtures.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            cells: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.cells.push((column.into(), value.into()));
    }

    /// Value of the first column with this name.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// Column names in wire order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    /// Values in wire order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// A connection that can run one statement.
///
/// `Ok(None)` marks a statement that produced no result set (DDL, cluster
/// ops), distinct from `Ok(Some(vec![]))` — an empty result set. Transport
/// and engine errors come back as `Err(text)` and are treated as transient
/// by the executor.
#[async_trait]
pub trait SqlEndpoint: Send {
    async fn query(&mut self, statement: &str) -> std::result::Result<Option<Vec<SqlRow>>, String>;
}

/// Issues statements with bounded/unbounded retry and structured fetch.
pub struct QueryExecutor {
    endpoint: Box<dyn SqlEndpoint>,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl QueryExecutor {
    /// A negative `max_attempts` means retry indefinitely.
    pub fn new(endpoint: Box<dyn SqlEndpoint>, max_attempts: i32, clock: Arc<dyn Clock>) -> Self {
        Self {
            endpoint,
            max_attempts: clamp_attempts(max_attempts),
            clock,
        }
    }

    pub fn set_max_attempts(&mut self, max_attempts: i32) {
        self.max_attempts = clamp_attempts(max_attempts);
    }

    /// Run a statement, retrying with a 1-second sleep between attempts.
    ///
    /// Exceeding the retry bound is fatal and names the offending
    /// statement.
    pub async fn execute(&mut self, statement: &str, log: bool) -> Result<Option<Vec<SqlRow>>> {
        let mut attempt: u32 = 0;

        loop {
            if log {
                debug!(statement, "query");
            }

            match self.endpoint.query(statement).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    warn!(statement, error = %error, "error until query processing");

                    if attempt > self.max_attempts {
                        return Err(SentinelError::QueryFailed {
                            statement: statement.to_string(),
                        });
                    }

                    attempt += 1;
                    self.clock.sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Run a statement and return its rows; `None` is the "no rows"
    /// sentinel for statements without a result set.
    pub async fn fetch(&mut self, statement: &str, log: bool) -> Result<Option<Vec<SqlRow>>> {
        self.execute(statement, log).await
    }
}

fn clamp_attempts(max_attempts: i32) -> u32 {
    if max_attempts < 0 {
        RETRY_FOREVER
    } else {
        max_attempts as u32
    }
}

/// Escape a value for embedding in a single-quoted SQL literal.
///
/// The agent builds textual SQL throughout; values are never parametrized.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\u{1a}' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out
}

/// Production endpoint over a persistent MySQL-wire connection.
pub struct MysqlEndpoint {
    conn: Conn,
}

impl MysqlEndpoint {
    /// Dial the engine, retrying once per second up to the attempt bound.
    ///
    /// The engine restarts freely under the orchestrator; connection
    /// attempts failing for minutes is a normal bootstrap condition.
    pub async fn connect(
        host: &str,
        port: u16,
        max_attempts: i32,
        clock: &dyn Clock,
    ) -> Result<Self> {
        let bound = clamp_attempts(max_attempts);
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(host.to_string())
            .tcp_port(port)
            .prefer_socket(false)
            .into();

        let mut attempt: u32 = 0;
        loop {
            match Conn::new(opts.clone()).await {
                Ok(conn) => return Ok(Self { conn }),
                Err(error) => {
                    warn!(host, port, error = %error, "engine connect failed");

                    if attempt >= bound {
                        return Err(SentinelError::EngineUnreachable(format!("{}:{}", host, port)));
                    }

                    attempt += 1;
                    clock.sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[async_trait]
impl SqlEndpoint for MysqlEndpoint {
    async fn query(&mut self, statement: &str) -> std::result::Result<Option<Vec<SqlRow>>, String> {
        let mut result = self
            .conn
            .query_iter(statement)
            .await
            .map_err(|e| e.to_string())?;

        let columns = result.columns();
        let rows: Vec<mysql_async::Row> = result.collect().await.map_err(|e| e.to_string())?;

        let Some(columns) = columns else {
            return Ok(None);
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut sql_row = SqlRow::new();
            for (i, column) in columns.iter().enumerate() {
                let value = row
                    .as_ref(i)
                    .map(value_to_string)
                    .unwrap_or_default();
                sql_row.push(column.name_str().into_owned(), value);
            }
            out.push(sql_row);
        }

        Ok(Some(out))
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::NULL => String::new(),
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Date(y, mo, d, h, mi, s, _) => {
            format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, mo, d, h, mi, s)
        }
        Value::Time(neg, d, h, mi, s, _) => {
            let sign = if *neg { "-" } else { "" };
            format!("{}{:02}:{:02}:{:02}", sign, u32::from(*h) + d * 24, mi, s)
        }
    }
}
