//! SQLite backend implementation for scriptrag-db
//!
//! Provides:
//! - `SqliteConnection` over a `rusqlite::Connection`, driven from
//!   `spawn_blocking` so pool callers never block the runtime
//! - `SqliteConnectionFactory` applying ScriptRAG's connection pragmas
//!
//! Closing goes through `rusqlite::Connection::close`, which hands the
//! handle back on failure. A failed close is reported as an error and the
//! handle stays owned by the connection, so the pool keeps counting it.

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{OpenFlags, ToSql};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Query used as the health probe
pub const PROBE_QUERY: &str = "SELECT 1";

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(n) => ToSqlOutput::from(*n),
            Value::Real(n) => ToSqlOutput::from(*n),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Integer(n),
        ValueRef::Real(n) => Value::Real(n),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// Where a connection URL points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteLocation {
    /// Private in-memory database (one per connection)
    Memory,
    /// Database file
    File(PathBuf),
}

impl SqliteLocation {
    /// Parse `sqlite://path`, `sqlite:path`, `sqlite::memory:`, `:memory:` or a bare path
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);

        match rest {
            "" => Err(Error::config(format!("no database path in '{url}'"))),
            ":memory:" => Ok(Self::Memory),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }
}

/// SQLite connection settings applied to every new connection
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteOptions {
    /// `PRAGMA journal_mode` (ignored for in-memory databases)
    pub journal_mode: String,
    /// `PRAGMA synchronous`
    pub synchronous: String,
    /// `PRAGMA foreign_keys`
    pub foreign_keys: bool,
    /// Busy handler timeout
    pub busy_timeout: Duration,
    /// `PRAGMA cache_size` (negative values are KiB)
    pub cache_size: i64,
    /// `PRAGMA temp_store`
    pub temp_store: String,
    /// Create the database file (and parent directories) when missing
    pub create_if_missing: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            journal_mode: "WAL".into(),
            synchronous: "NORMAL".into(),
            foreign_keys: true,
            busy_timeout: Duration::from_secs(30),
            cache_size: -2000,
            temp_store: "MEMORY".into(),
            create_if_missing: true,
        }
    }
}

impl SqliteOptions {
    fn apply(&self, conn: &rusqlite::Connection, in_memory: bool) -> rusqlite::Result<()> {
        conn.busy_timeout(self.busy_timeout)?;
        if !in_memory {
            // journal_mode answers with a row, so it cannot go through pragma_update
            let mode: String = conn.pragma_update_and_check(
                None,
                "journal_mode",
                &self.journal_mode,
                |row| row.get(0),
            )?;
            debug!("SQLite journal_mode = {}", mode);
        }
        conn.pragma_update(None, "synchronous", &self.synchronous)?;
        conn.pragma_update(None, "foreign_keys", self.foreign_keys)?;
        conn.pragma_update(None, "cache_size", self.cache_size)?;
        conn.pragma_update(None, "temp_store", &self.temp_store)?;
        Ok(())
    }
}

fn open_blocking(
    location: &SqliteLocation,
    config: &ConnectionConfig,
    options: &SqliteOptions,
) -> Result<rusqlite::Connection> {
    let mut flags = OpenFlags::default();
    if config.read_only {
        flags.remove(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE);
        flags.insert(OpenFlags::SQLITE_OPEN_READ_ONLY);
    } else if !options.create_if_missing {
        flags.remove(OpenFlags::SQLITE_OPEN_CREATE);
    }

    let conn = match location {
        SqliteLocation::Memory => rusqlite::Connection::open_in_memory_with_flags(flags),
        SqliteLocation::File(path) => {
            if options.create_if_missing && !config.read_only {
                ensure_parent_dir(path)?;
            }
            rusqlite::Connection::open_with_flags(path, flags)
        }
    }
    .map_err(|e| Error::connection_with_source("failed to open sqlite database", e))?;

    options
        .apply(&conn, *location == SqliteLocation::Memory)
        .map_err(|e| Error::connection_with_source("failed to configure sqlite connection", e))?;

    for (key, value) in &config.properties {
        conn.pragma_update(None, key, value)
            .map_err(|e| Error::connection_with_source(format!("failed to set PRAGMA {key}"), e))?;
    }

    Ok(conn)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::connection_with_source(
                format!("failed to create database directory {}", parent.display()),
                e,
            )
        })?;
    }
    Ok(())
}

/// SQLite connection implementation
pub struct SqliteConnection {
    conn: Arc<Mutex<Option<rusqlite::Connection>>>,
    location: SqliteLocation,
}

impl SqliteConnection {
    /// Wrap an already opened rusqlite connection
    pub fn new(conn: rusqlite::Connection, location: SqliteLocation) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            location,
        }
    }

    /// Database location
    pub fn location(&self) -> &SqliteLocation {
        &self.location
    }

    /// Run `f` against the live handle on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::internal("sqlite connection mutex poisoned"))?;
            let handle = guard
                .as_mut()
                .ok_or_else(|| Error::connection("connection is closed"))?;
            f(handle)
        })
        .await?
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = sql.to_owned();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::query_with_sql(sql.as_str(), e))?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

            let mut rows = stmt
                .query(rusqlite::params_from_iter(params.iter()))
                .map_err(|e| Error::query_with_sql(sql.as_str(), e))?;

            let mut out = Vec::new();
            while let Some(row) = rows
                .next()
                .map_err(|e| Error::query_with_sql(sql.as_str(), e))?
            {
                let mut values = Vec::with_capacity(columns.len());
                for idx in 0..columns.len() {
                    let value = row
                        .get_ref(idx)
                        .map_err(|e| Error::query_with_sql(sql.as_str(), e))?;
                    values.push(value_from_ref(value));
                }
                out.push(Row::new(columns.clone(), values));
            }
            Ok(out)
        })
        .await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = sql.to_owned();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let affected = conn
                .execute(&sql, rusqlite::params_from_iter(params.iter()))
                .map_err(|e| Error::query_with_sql(sql.as_str(), e))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn is_valid(&self) -> bool {
        self.with_conn(|conn| {
            conn.query_row(PROBE_QUERY, [], |row| row.get::<_, i64>(0))
                .map_err(|e| Error::query_with_sql(PROBE_QUERY, e))
        })
        .await
        .is_ok()
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::internal("sqlite connection mutex poisoned"))?;
            let Some(handle) = guard.take() else {
                return Ok(());
            };
            match handle.close() {
                Ok(()) => Ok(()),
                Err((handle, e)) => {
                    *guard = Some(handle);
                    Err(Error::connection_with_source(
                        "failed to close sqlite connection",
                        e,
                    ))
                }
            }
        })
        .await?
    }
}

/// Factory producing configured SQLite connections
#[derive(Debug, Clone, Default)]
pub struct SqliteConnectionFactory {
    options: SqliteOptions,
}

impl SqliteConnectionFactory {
    /// Create a factory with explicit options
    pub fn new(options: SqliteOptions) -> Self {
        Self { options }
    }

    /// Options applied to each connection
    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let location = SqliteLocation::parse(&config.url)?;
        let options = self.options.clone();
        let config = config.clone();
        let timeout = Duration::from_millis(config.connect_timeout_ms);

        let open_location = location.clone();
        let open = tokio::task::spawn_blocking(move || open_blocking(&open_location, &config, &options));

        let conn = tokio::time::timeout(timeout, open)
            .await
            .map_err(|_| {
                Error::connection(format!(
                    "timed out opening sqlite database after {}ms",
                    timeout.as_millis()
                ))
            })???;

        debug!("Opened SQLite connection to {:?}", location);
        Ok(Box::new(SqliteConnection::new(conn, location)))
    }
}
