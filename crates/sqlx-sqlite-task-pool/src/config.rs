//! Configuration for SQLite sessions and the connection pool

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for one logical database.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_task_pool::{DatabaseConfig, PoolConfig};
/// use std::time::Duration;
///
/// // Use defaults for everything but the path
/// let config = DatabaseConfig::new("app.db");
///
/// // Customize pool sizing
/// let config = DatabaseConfig {
///     pool: PoolConfig {
///         max_connections: 2,
///         acquire_timeout: Duration::from_secs(1),
///         ..Default::default()
///     },
///     ..DatabaseConfig::new("app.db")
/// };
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
   /// Path to the database file
   pub path: PathBuf,

   /// Create the database file if it does not exist
   ///
   /// Default: true
   pub create_if_missing: bool,

   /// How long a statement waits on a locked database before failing
   ///
   /// Default: 5 seconds
   pub busy_timeout: Duration,

   /// Maximum number of compiled statements cached per physical connection
   ///
   /// Each connection keeps its own cache of compiled statements keyed by
   /// SQL text hash. Oldest entries are dropped once this bound is reached.
   ///
   /// Default: 100
   pub statement_cache_capacity: usize,

   /// Prefer real prepared statements over one-shot compilation
   ///
   /// Advisory flag: when set, executions ask the driver to retain the
   /// compiled form so repeat executions with different bind values skip
   /// re-compilation.
   ///
   /// Default: true
   pub persistent_statements: bool,

   /// Maximum entries in the process-wide read statement cache
   ///
   /// Consumed by the shared read path layered above the pool; the pool
   /// itself only caches per connection.
   ///
   /// Default: 256
   pub max_cached_statements: usize,

   /// Connection pool sizing and acquisition behavior
   pub pool: PoolConfig,
}

impl DatabaseConfig {
   /// Config for the given database file with default settings.
   pub fn new(path: impl Into<PathBuf>) -> Self {
      Self {
         path: path.into(),
         ..Default::default()
      }
   }
}

impl Default for DatabaseConfig {
   fn default() -> Self {
      Self {
         path: PathBuf::new(),
         create_if_missing: true,
         busy_timeout: Duration::from_secs(5),
         statement_cache_capacity: 100,
         persistent_statements: true,
         max_cached_statements: 256,
         pool: PoolConfig::default(),
      }
   }
}

/// Sizing and acquisition settings for the connection pool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
   /// Maximum number of live physical connections
   ///
   /// 0 means auto-size from detected parallelism (see
   /// [`PoolConfig::effective_size`]).
   ///
   /// Default: 0 (auto)
   pub max_connections: u32,

   /// Connections per detected worker when auto-sizing
   ///
   /// Default: 5
   pub connections_per_worker: u32,

   /// How long `acquire` waits for a free connection before reporting
   /// pool exhaustion
   ///
   /// Default: 5 seconds
   pub acquire_timeout: Duration,

   /// Fill the pool to capacity at startup instead of connecting lazily
   ///
   /// Default: false
   pub prewarm: bool,
}

impl PoolConfig {
   /// Resolve the configured size to a concrete capacity.
   ///
   /// A size of zero auto-computes as
   /// `available_parallelism × connections_per_worker`, never less than one.
   pub fn effective_size(&self) -> u32 {
      if self.max_connections > 0 {
         return self.max_connections;
      }
      let workers = std::thread::available_parallelism()
         .map(|n| n.get() as u32)
         .unwrap_or(1);
      (workers * self.connections_per_worker.max(1)).max(1)
   }
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         max_connections: 0,
         connections_per_worker: 5,
         acquire_timeout: Duration::from_secs(5),
         prewarm: false,
      }
   }
}
