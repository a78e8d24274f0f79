//! Connection traits for scriptrag-db
//!
//! The pool only needs two capabilities from a connection: a health probe
//! and an explicit close that reports failure. Everything else here is what
//! ScriptRAG's search and indexing code uses once it holds a connection.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::types::{Row, Value};

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement that modifies data, returns affected row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a batch of statements, returns affected counts per statement
    async fn execute_batch(&self, statements: &[(&str, &[Value])]) -> Result<Vec<u64>> {
        let mut results = Vec::with_capacity(statements.len());
        for (sql, params) in statements {
            results.push(self.execute(sql, params).await?);
        }
        Ok(results)
    }

    /// Execute a query and return the first row
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Health probe: run a trivial query and report whether it succeeded
    async fn is_valid(&self) -> bool;

    /// Close the connection.
    ///
    /// An `Err` means the underlying resource may still be held. The pool
    /// keeps counting such a connection against its capacity.
    async fn close(&self) -> Result<()>;
}

/// Configuration for creating connections
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection URL (`sqlite://path/to/scriptrag.db`, `sqlite::memory:` or a bare path)
    pub url: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Open the database read-only
    pub read_only: bool,
    /// Additional driver properties (applied as PRAGMAs by the SQLite backend)
    pub properties: HashMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 10_000,
            read_only: false,
            properties: HashMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration with just a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Open read-only
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Add a connection property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::new("sqlite://scriptrag.db")
            .with_connect_timeout(5000)
            .with_read_only(true)
            .with_property("mmap_size", "268435456");

        assert_eq!(config.url, "sqlite://scriptrag.db");
        assert_eq!(config.connect_timeout_ms, 5000);
        assert!(config.read_only);
        assert_eq!(
            config.properties.get("mmap_size"),
            Some(&"268435456".to_string())
        );
    }

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert!(config.url.is_empty());
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert!(!config.read_only);
        assert!(config.properties.is_empty());
    }
}
