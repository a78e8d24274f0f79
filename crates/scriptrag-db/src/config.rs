//! Database settings for scriptrag-db
//!
//! Loaded from the `database:` section of ScriptRAG's YAML settings and
//! turned into a [`PoolConfig`] plus [`SqliteOptions`]. A leading `~` in
//! `database_path` stands for the user's home directory.
//!
//! ```yaml
//! database_path: /var/lib/scriptrag/scriptrag.db
//! pool_min_size: 2
//! pool_max_size: 8
//! max_idle_time_secs: 300
//! journal_mode: WAL
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::sqlite::SqliteOptions;

/// Serializable database settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSettings {
    /// SQLite database file (or `:memory:`)
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Connections opened at startup and kept warm (default: 1)
    #[serde(default = "default_pool_min_size")]
    pub pool_min_size: usize,

    /// Maximum concurrent connections (default: 10)
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: usize,

    /// Idle queue capacity (default: same as `pool_max_size`)
    #[serde(default)]
    pub pool_max_idle: Option<usize>,

    /// Connection acquire timeout in milliseconds (default: 30000)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Idle connections unused for this long are closed (default: 600)
    #[serde(default = "default_max_idle_time_secs")]
    pub max_idle_time_secs: u64,

    /// Background health check interval; 0 disables it (default: 30)
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Graceful shutdown wait in milliseconds (default: 5000)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Probe idle connections before handing them out
    #[serde(default)]
    pub test_on_borrow: bool,

    /// Open the database read-only
    #[serde(default)]
    pub read_only: bool,

    /// SQLite busy timeout in milliseconds (default: 30000)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// `PRAGMA journal_mode` (default: WAL)
    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,

    /// `PRAGMA synchronous` (default: NORMAL)
    #[serde(default = "default_synchronous")]
    pub synchronous: String,

    /// `PRAGMA foreign_keys` (default: true)
    #[serde(default = "default_true")]
    pub foreign_keys: bool,

    /// `PRAGMA cache_size` (default: -2000, i.e. 2 MiB)
    #[serde(default = "default_cache_size")]
    pub cache_size: i64,

    /// `PRAGMA temp_store` (default: MEMORY)
    #[serde(default = "default_temp_store")]
    pub temp_store: String,

    /// Extra PRAGMAs applied to every connection
    #[serde(default)]
    pub pragmas: HashMap<String, String>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("scriptrag.db")
}

fn default_pool_min_size() -> usize {
    1
}

fn default_pool_max_size() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    30000
}

fn default_max_idle_time_secs() -> u64 {
    600
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_busy_timeout_ms() -> u64 {
    30000
}

fn default_journal_mode() -> String {
    "WAL".into()
}

fn default_synchronous() -> String {
    "NORMAL".into()
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> i64 {
    -2000
}

fn default_temp_store() -> String {
    "MEMORY".into()
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            pool_min_size: default_pool_min_size(),
            pool_max_size: default_pool_max_size(),
            pool_max_idle: None,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_idle_time_secs: default_max_idle_time_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            test_on_borrow: false,
            read_only: false,
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: default_journal_mode(),
            synchronous: default_synchronous(),
            foreign_keys: true,
            cache_size: default_cache_size(),
            temp_store: default_temp_store(),
            pragmas: HashMap::new(),
        }
    }
}

impl DatabaseSettings {
    /// Parse settings from YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid database settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }

    /// Check the settings describe a usable pool
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::config("database_path must not be empty"));
        }
        if self.resolved_database_path().starts_with("~") {
            return Err(Error::config(format!(
                "cannot expand {}: no home directory",
                self.database_path.display()
            )));
        }
        self.to_pool_config().validate()
    }

    /// `database_path` with a leading `~` expanded to the home directory.
    /// Left as written when no home directory is known.
    pub fn resolved_database_path(&self) -> PathBuf {
        match (self.database_path.strip_prefix("~"), dirs::home_dir()) {
            (Ok(rest), Some(home)) => home.join(rest),
            _ => self.database_path.clone(),
        }
    }

    /// Connection URL understood by the SQLite factory
    pub fn connection_url(&self) -> String {
        format!("sqlite://{}", self.resolved_database_path().display())
    }

    /// Pool configuration derived from these settings
    pub fn to_pool_config(&self) -> PoolConfig {
        let mut connection =
            ConnectionConfig::new(self.connection_url()).with_read_only(self.read_only);
        for (key, value) in &self.pragmas {
            connection = connection.with_property(key, value);
        }

        PoolConfig {
            connection,
            min_size: self.pool_min_size,
            max_size: self.pool_max_size,
            max_idle: self.pool_max_idle,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            max_idle_time: Duration::from_secs(self.max_idle_time_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            test_on_borrow: self.test_on_borrow,
        }
    }

    /// SQLite options derived from these settings
    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            journal_mode: self.journal_mode.clone(),
            synchronous: self.synchronous.clone(),
            foreign_keys: self.foreign_keys,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            cache_size: self.cache_size,
            temp_store: self.temp_store.clone(),
            create_if_missing: !self.read_only,
        }
    }
}
