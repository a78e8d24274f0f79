//! # scriptrag-db
//!
//! Pooled SQLite connectivity for ScriptRAG's search engine, indexers and
//! mentor storage.
//!
//! ## Features
//!
//! - **Connection Pooling**: bounded pool with health probes, idle eviction and
//!   exact slot accounting when closing a connection fails
//! - **SQLite Backend**: `rusqlite` connections configured with ScriptRAG's pragmas
//! - **Settings**: YAML-backed database settings mapped onto the pool
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scriptrag_db::prelude::*;
//!
//! let settings = DatabaseSettings::from_file("scriptrag.yaml")?;
//! let factory = Arc::new(SqliteConnectionFactory::new(settings.sqlite_options()));
//! let pool = SimpleConnectionPool::new(settings.to_pool_config(), factory).await?;
//!
//! let conn = pool.get().await?;
//! let rows = conn
//!     .query("SELECT id, title FROM scripts WHERE author = ?", &[Value::from("Rian Johnson")])
//!     .await?;
//! conn.release().await;
//!
//! pool.close(false).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod sqlite;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{Row, Value};

    pub use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};

    pub use crate::pool::{
        create_pool, create_pool_with_config, AtomicPoolStats, ConnectionPool,
        HealthCheckReport, PoolBuilder, PoolConfig, PoolState, PoolStats, PooledConnection,
        RecycleReason, SimpleConnectionPool,
    };

    pub use crate::sqlite::{SqliteConnection, SqliteConnectionFactory, SqliteLocation, SqliteOptions};

    pub use crate::config::DatabaseSettings;
}

pub use error::{Error, Result};
pub use types::Value;
