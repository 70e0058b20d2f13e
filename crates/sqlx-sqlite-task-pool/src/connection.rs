//! One live SQLite session with a local statement cache and explicit
//! transaction state.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow};
use sqlx::{ConnectOptions, Connection, Executor};
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::{Error, Result};

/// Process-wide counter for connection identifiers.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a statement compiled on one physical connection.
///
/// The handle is valid only as long as its owning connection: it carries the
/// connection id so callers can detect handles that outlived a recycled
/// session. The compiled form itself is retained by the driver; the handle
/// holds the SQL text needed to re-execute it with fresh bind values.
#[derive(Debug, Clone)]
pub struct StatementHandle {
   sql: Arc<str>,
   fingerprint: u64,
   connection_id: u64,
}

impl StatementHandle {
   /// The SQL text this handle was compiled from.
   pub fn sql(&self) -> &str {
      &self.sql
   }

   /// Cache key this handle was stored under.
   pub fn fingerprint(&self) -> u64 {
      self.fingerprint
   }

   /// Identifier of the connection that compiled this statement.
   pub fn connection_id(&self) -> u64 {
      self.connection_id
   }

   /// Rough per-entry memory footprint, for cache statistics.
   pub fn approx_memory(&self) -> usize {
      std::mem::size_of::<Self>() + self.sql.len()
   }
}

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone)]
pub struct WriteResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,

   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only set for INSERT operations on tables with a ROWID.
   pub last_insert_id: i64,
}

/// One live SQLite session.
///
/// ## State machine
///
/// `Idle → InTransaction → Idle` (commit or rollback returns to Idle);
/// any unrecoverable driver error moves the connection to `Broken`.
/// Broken connections refuse further work and are discarded by their
/// owner, never reused.
///
/// ## Statement cache
///
/// Each connection keeps its own map of SQL-hash → [`StatementHandle`],
/// bounded by the configured capacity with oldest-first eviction. The
/// driver retains the compiled statements; re-preparing a cached shape is
/// a map lookup, not a round trip.
///
/// At most one task may issue operations on a given connection at any
/// instant; all methods take `&mut self` so exclusive access is enforced
/// by ownership.
#[derive(Debug)]
pub struct PhysicalConnection {
   id: u64,
   conn: SqliteConnection,
   statements: HashMap<u64, StatementHandle>,
   statement_order: VecDeque<u64>,
   statement_capacity: usize,
   persistent_statements: bool,
   in_transaction: bool,
   broken: bool,
   prepare_count: u64,
   last_used: Instant,
}

impl PhysicalConnection {
   /// Open a new session for the configured database.
   ///
   /// Failures map to [`Error::Connectivity`] so callers can distinguish
   /// "the database is unreachable" from statement-level errors.
   pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
      let options = SqliteConnectOptions::new()
         .filename(&config.path)
         .create_if_missing(config.create_if_missing)
         .journal_mode(SqliteJournalMode::Wal)
         .busy_timeout(config.busy_timeout);

      let conn = options.connect().await.map_err(Error::Connectivity)?;
      let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
      debug!(connection_id = id, path = %config.path.display(), "opened connection");

      Ok(Self {
         id,
         conn,
         statements: HashMap::new(),
         statement_order: VecDeque::new(),
         statement_capacity: config.statement_cache_capacity,
         persistent_statements: config.persistent_statements,
         in_transaction: false,
         broken: false,
         prepare_count: 0,
         last_used: Instant::now(),
      })
   }

   /// Unique identifier of this connection.
   pub fn id(&self) -> u64 {
      self.id
   }

   /// Whether an explicit transaction is currently open.
   pub fn in_transaction(&self) -> bool {
      self.in_transaction
   }

   /// Whether this connection hit an unrecoverable error.
   pub fn is_broken(&self) -> bool {
      self.broken
   }

   /// How many statements have been compiled on this connection.
   ///
   /// Cache hits do not increment this counter, which makes it suitable
   /// for verifying that a shape was prepared exactly once.
   pub fn prepare_count(&self) -> u64 {
      self.prepare_count
   }

   /// Number of entries in the local statement cache.
   pub fn cached_statement_count(&self) -> usize {
      self.statements.len()
   }

   /// When this connection last executed a statement.
   pub fn last_used(&self) -> Instant {
      self.last_used
   }

   /// Hash SQL text into a local cache key.
   pub fn text_fingerprint(sql: &str) -> u64 {
      let mut hasher = std::collections::hash_map::DefaultHasher::new();
      sql.hash(&mut hasher);
      hasher.finish()
   }

   /// Return the cached handle for this SQL text, compiling it on first use.
   pub async fn prepare(&mut self, sql: &str) -> Result<StatementHandle> {
      self.prepare_keyed(Self::text_fingerprint(sql), sql).await
   }

   /// Like [`prepare`](Self::prepare), but cached under a caller-supplied
   /// key. Used by shape-fingerprinted caches where two different SQL texts
   /// must never collide and the key is derived from query structure.
   pub async fn prepare_keyed(&mut self, fingerprint: u64, sql: &str) -> Result<StatementHandle> {
      self.ensure_usable()?;

      if let Some(handle) = self.statements.get(&fingerprint) {
         return Ok(handle.clone());
      }

      // Compile through the driver so the prepared form is retained for
      // subsequent executions of the same text.
      (&mut self.conn).prepare(sql).await.map_err(|e| self.fail(e))?;
      self.prepare_count += 1;

      let handle = StatementHandle {
         sql: Arc::from(sql),
         fingerprint,
         connection_id: self.id,
      };

      // Oldest-first eviction once the local cache is full.
      if self.statement_capacity > 0 && self.statements.len() >= self.statement_capacity {
         if let Some(oldest) = self.statement_order.pop_front() {
            self.statements.remove(&oldest);
         }
      }
      self.statements.insert(fingerprint, handle.clone());
      self.statement_order.push_back(fingerprint);

      Ok(handle)
   }

   /// Execute a query and return all matching rows.
   pub async fn fetch_all(&mut self, sql: &str, params: Vec<JsonValue>) -> Result<Vec<SqliteRow>> {
      self.ensure_usable()?;
      self.last_used = Instant::now();

      let mut q = sqlx::query(sql).persistent(self.persistent_statements);
      for value in params {
         q = bind_value(q, value);
      }
      q.fetch_all(&mut self.conn).await.map_err(|e| self.fail(e))
   }

   /// Execute a write statement (INSERT/UPDATE/DELETE).
   pub async fn execute(&mut self, sql: &str, params: Vec<JsonValue>) -> Result<WriteResult> {
      self.ensure_usable()?;
      self.last_used = Instant::now();

      let mut q = sqlx::query(sql).persistent(self.persistent_statements);
      for value in params {
         q = bind_value(q, value);
      }
      let result = q.execute(&mut self.conn).await.map_err(|e| self.fail(e))?;

      Ok(WriteResult {
         rows_affected: result.rows_affected(),
         last_insert_id: result.last_insert_rowid(),
      })
   }

   /// Begin an explicit transaction.
   ///
   /// Starting a second transaction while one is open is an error, never
   /// silently flattened.
   pub async fn begin(&mut self) -> Result<()> {
      self.ensure_usable()?;
      if self.in_transaction {
         return Err(Error::TransactionAlreadyOpen);
      }

      sqlx::query("BEGIN IMMEDIATE")
         .execute(&mut self.conn)
         .await
         .map_err(|e| self.fail(e))?;
      self.in_transaction = true;
      Ok(())
   }

   /// Commit the open transaction.
   pub async fn commit(&mut self) -> Result<()> {
      self.ensure_usable()?;

      sqlx::query("COMMIT")
         .execute(&mut self.conn)
         .await
         .map_err(|e| self.fail(e))?;
      self.in_transaction = false;
      debug!(connection_id = self.id, "transaction committed");
      Ok(())
   }

   /// Roll back the open transaction.
   ///
   /// A no-op when no transaction is open, so compensating rollbacks in
   /// error paths are always safe to issue.
   pub async fn rollback(&mut self) -> Result<()> {
      if !self.in_transaction {
         return Ok(());
      }

      let result = sqlx::query("ROLLBACK").execute(&mut self.conn).await;
      self.in_transaction = false;
      match result {
         Ok(_) => {
            debug!(connection_id = self.id, "transaction rolled back");
            Ok(())
         }
         Err(e) => {
            // A failed rollback leaves the session in an unknown state.
            self.broken = true;
            Err(Error::Sqlx(e))
         }
      }
   }

   /// Cheap liveness probe.
   ///
   /// Runs a trivial round trip; on failure the connection is marked
   /// broken so owners discard it instead of handing it out.
   pub async fn ping(&mut self) -> bool {
      if self.broken {
         return false;
      }
      match self.conn.ping().await {
         Ok(()) => true,
         Err(e) => {
            warn!(connection_id = self.id, error = %e, "liveness check failed");
            self.broken = true;
            false
         }
      }
   }

   /// Mark this connection broken so it is discarded rather than reused.
   pub fn mark_broken(&mut self) {
      self.broken = true;
   }

   /// Close the underlying session.
   pub async fn close(self) -> Result<()> {
      self.conn.close().await.map_err(Error::Sqlx)
   }

   fn ensure_usable(&self) -> Result<()> {
      if self.broken {
         return Err(Error::BrokenConnection);
      }
      Ok(())
   }

   /// Convert a driver error, marking the connection broken when the
   /// failure is at the session level rather than the statement level.
   fn fail(&mut self, e: sqlx::Error) -> Error {
      if matches!(
         e,
         sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed | sqlx::Error::Protocol(_)
      ) {
         warn!(connection_id = self.id, error = %e, "marking connection broken");
         self.broken = true;
      }
      Error::Sqlx(e)
   }
}

/// Helper function to bind a JSON value to a SQLx query
pub fn bind_value<'a>(
   query: sqlx::query::Query<'a, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'a>>,
   value: JsonValue,
) -> sqlx::query::Query<'a, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'a>> {
   if value.is_null() {
      query.bind(None::<JsonValue>)
   } else if value.is_string() {
      query.bind(value.as_str().unwrap().to_owned())
   } else if let Some(number) = value.as_number() {
      // Preserve integer precision by binding as i64 when possible
      if let Some(int_val) = number.as_i64() {
         query.bind(int_val)
      } else if let Some(uint_val) = number.as_u64() {
         // Try to fit u64 into i64 (SQLite's INTEGER type)
         if uint_val <= i64::MAX as u64 {
            query.bind(uint_val as i64)
         } else {
            // Value too large for i64, use f64 (will lose precision)
            query.bind(uint_val as f64)
         }
      } else {
         // Not an integer, bind as f64
         query.bind(number.as_f64().unwrap_or_default())
      }
   } else {
      query.bind(value)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use tempfile::TempDir;

   async fn create_test_connection() -> (PhysicalConnection, TempDir) {
      let temp_dir = TempDir::new().expect("Failed to create temp directory");
      let config = DatabaseConfig::new(temp_dir.path().join("test.db"));
      let conn = PhysicalConnection::connect(&config)
         .await
         .expect("Failed to connect to test database");

      (conn, temp_dir)
   }

   #[tokio::test]
   async fn test_prepare_caches_by_text() {
      let (mut conn, _temp) = create_test_connection().await;
      conn
         .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", vec![])
         .await
         .unwrap();

      let first = conn.prepare("SELECT name FROM t WHERE id = ?").await.unwrap();
      let second = conn.prepare("SELECT name FROM t WHERE id = ?").await.unwrap();

      assert_eq!(first.fingerprint(), second.fingerprint());
      assert_eq!(conn.prepare_count(), 1);
      assert_eq!(conn.cached_statement_count(), 1);

      // A structurally different statement compiles separately
      conn.prepare("SELECT id FROM t WHERE name = ?").await.unwrap();
      assert_eq!(conn.prepare_count(), 2);
   }

   #[tokio::test]
   async fn test_local_cache_evicts_oldest() {
      let (_, temp) = create_test_connection().await;
      let config = DatabaseConfig {
         statement_cache_capacity: 2,
         ..DatabaseConfig::new(temp.path().join("evict.db"))
      };
      let mut conn = PhysicalConnection::connect(&config).await.unwrap();
      conn
         .execute("CREATE TABLE t (a INT, b INT, c INT)", vec![])
         .await
         .unwrap();

      conn.prepare("SELECT a FROM t").await.unwrap();
      conn.prepare("SELECT b FROM t").await.unwrap();
      conn.prepare("SELECT c FROM t").await.unwrap();

      assert_eq!(conn.cached_statement_count(), 2);

      // The first statement was evicted, so it compiles again
      conn.prepare("SELECT a FROM t").await.unwrap();
      assert_eq!(conn.prepare_count(), 4);
   }

   #[tokio::test]
   async fn test_transaction_state_machine() {
      let (mut conn, _temp) = create_test_connection().await;
      conn
         .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![])
         .await
         .unwrap();

      assert!(!conn.in_transaction());
      conn.begin().await.unwrap();
      assert!(conn.in_transaction());

      // Nested begin is rejected, outer transaction stays open
      let err = conn.begin().await.unwrap_err();
      assert!(matches!(err, Error::TransactionAlreadyOpen));
      assert!(conn.in_transaction());

      conn.commit().await.unwrap();
      assert!(!conn.in_transaction());
   }

   #[tokio::test]
   async fn test_rollback_is_idempotent() {
      let (mut conn, _temp) = create_test_connection().await;

      // No transaction open: rollback is a no-op
      conn.rollback().await.unwrap();

      conn.begin().await.unwrap();
      conn.rollback().await.unwrap();
      assert!(!conn.in_transaction());
      conn.rollback().await.unwrap();
   }

   #[tokio::test]
   async fn test_rollback_discards_writes() {
      let (mut conn, _temp) = create_test_connection().await;
      conn
         .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, val INT)", vec![])
         .await
         .unwrap();

      conn.begin().await.unwrap();
      conn
         .execute("INSERT INTO t (val) VALUES (?)", vec![serde_json::json!(1)])
         .await
         .unwrap();
      conn.rollback().await.unwrap();

      let rows = conn.fetch_all("SELECT * FROM t", vec![]).await.unwrap();
      assert!(rows.is_empty());
   }

   #[tokio::test]
   async fn test_ping_on_live_connection() {
      let (mut conn, _temp) = create_test_connection().await;
      assert!(conn.ping().await);
      assert!(!conn.is_broken());
   }

   #[tokio::test]
   async fn test_broken_connection_refuses_work() {
      let (mut conn, _temp) = create_test_connection().await;
      conn.mark_broken();

      assert!(!conn.ping().await);
      let err = conn.fetch_all("SELECT 1", vec![]).await.err().unwrap();
      assert!(matches!(err, Error::BrokenConnection));
   }
}
