//! The shared read connection behind the global statement cache.

use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx_sqlite_task_pool::{DatabaseConfig, PhysicalConnection, StatementHandle};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::cache::{CacheStats, GlobalStatementCache};
use crate::fingerprint::ShapeFingerprint;
use crate::{Error, Result};

/// One long-lived connection dedicated to read-only hot-path operations.
///
/// Read statements never mutate connection-local state (no transaction, no
/// session variables), so a single session can serve every task's reads and
/// remove per-task connection lookup and pool contention from the dominant
/// path. The underlying driver call path is not reentrant, so each
/// prepare/execute sequence runs under an internal async lock; that lock is
/// the one mandatory serialization point in the design and bounds the
/// maximum throughput of this path.
///
/// If the session breaks, the next call reconnects and clears the global
/// cache: a statement handle never outlives the connection that compiled it.
pub struct SingletonReadConnection {
   config: DatabaseConfig,
   conn: Mutex<PhysicalConnection>,
   cache: GlobalStatementCache,
}

impl SingletonReadConnection {
   /// Open the shared read session and its statement cache.
   pub async fn connect(config: DatabaseConfig, max_cached_statements: usize) -> Result<Self> {
      let conn = PhysicalConnection::connect(&config).await?;
      debug!(connection_id = conn.id(), "opened shared read connection");
      Ok(Self {
         config,
         conn: Mutex::new(conn),
         cache: GlobalStatementCache::new(max_cached_statements),
      })
   }

   /// The process-wide statement cache backing this connection.
   pub fn cache(&self) -> &GlobalStatementCache {
      &self.cache
   }

   /// Look up a statement by fingerprint, building and preparing it on miss.
   ///
   /// `build_sql` is only invoked on a cache miss. Only read-only statements
   /// are eligible; anything else is rejected before touching the session.
   pub async fn get_or_prepare<F>(
      &self,
      fingerprint: ShapeFingerprint,
      build_sql: F,
   ) -> Result<StatementHandle>
   where
      F: FnOnce() -> String,
   {
      if let Some(handle) = self.cache.get(fingerprint) {
         return Ok(handle);
      }

      let sql = build_sql();
      if !is_read_statement(&sql) {
         return Err(Error::NotReadOnly(sql));
      }

      let mut conn = self.conn.lock().await;
      self.ensure_live(&mut conn).await?;
      let handle = conn.prepare_keyed(fingerprint.as_u64(), &sql).await?;
      self.cache.insert(fingerprint, handle.clone());
      Ok(handle)
   }

   /// Bind positional parameters and run a cached statement.
   ///
   /// Returns the full ordered row set; re-reading requires a fresh execute.
   pub async fn execute(
      &self,
      handle: &StatementHandle,
      params: Vec<JsonValue>,
   ) -> Result<Vec<SqliteRow>> {
      let mut conn = self.conn.lock().await;
      self.ensure_live(&mut conn).await?;
      self.execute_locked(&mut conn, handle, params).await
   }

   /// Resolve and run a statement in one critical section.
   ///
   /// The prepare/execute sequence for one call completes atomically with
   /// respect to other tasks' calls on this connection.
   pub async fn query<F>(
      &self,
      fingerprint: ShapeFingerprint,
      build_sql: F,
      params: Vec<JsonValue>,
   ) -> Result<Vec<SqliteRow>>
   where
      F: FnOnce() -> String,
   {
      let cached = self.cache.get(fingerprint);

      let mut conn = self.conn.lock().await;
      self.ensure_live(&mut conn).await?;

      let handle = match cached {
         Some(handle) => handle,
         None => {
            let sql = build_sql();
            if !is_read_statement(&sql) {
               return Err(Error::NotReadOnly(sql));
            }
            let handle = conn.prepare_keyed(fingerprint.as_u64(), &sql).await?;
            self.cache.insert(fingerprint, handle.clone());
            handle
         }
      };

      self.execute_locked(&mut conn, &handle, params).await
   }

   async fn execute_locked(
      &self,
      conn: &mut MutexGuard<'_, PhysicalConnection>,
      handle: &StatementHandle,
      params: Vec<JsonValue>,
   ) -> Result<Vec<SqliteRow>> {
      // A handle compiled on a previous session is stale after a reconnect;
      // re-prepare it on the live one before executing.
      if handle.connection_id() != conn.id() {
         conn
            .prepare_keyed(handle.fingerprint(), handle.sql())
            .await?;
      }
      Ok(conn.fetch_all(handle.sql(), params).await?)
   }

   /// Statements compiled on the current session.
   pub async fn prepare_count(&self) -> u64 {
      self.conn.lock().await.prepare_count()
   }

   /// Close the shared session.
   pub async fn close(self) -> Result<()> {
      let conn = self.conn.into_inner();
      conn.close().await?;
      Ok(())
   }

   async fn ensure_live(&self, conn: &mut MutexGuard<'_, PhysicalConnection>) -> Result<()> {
      if !conn.is_broken() {
         return Ok(());
      }
      warn!(connection_id = conn.id(), "shared read connection broken, reconnecting");
      let fresh = PhysicalConnection::connect(&self.config).await?;
      // Every cached handle was bound to the dead session.
      self.cache.clear();
      **conn = fresh;
      Ok(())
   }
}

/// Whether a statement is eligible for the shared read connection.
///
/// The leading keyword is not enough: a `WITH` prefix can front either a
/// read or a mutation, so classification uses the top-level statement verb
/// after the CTE list. PRAGMA is excluded because it can mutate session
/// state, which must never happen on the shared session.
pub fn is_read_statement(sql: &str) -> bool {
   matches!(
      top_level_verb(sql).as_deref(),
      Some("SELECT" | "VALUES" | "EXPLAIN")
   )
}

/// Keywords that can start a top-level SQLite command.
const STATEMENT_VERBS: &[&str] = &[
   "SELECT", "VALUES", "EXPLAIN", "INSERT", "REPLACE", "UPDATE", "DELETE",
   "CREATE", "DROP", "ALTER", "PRAGMA", "ATTACH", "DETACH", "VACUUM",
   "REINDEX", "ANALYZE", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE",
];

/// The first top-level statement keyword in `sql`.
///
/// Words inside parentheses, string literals, and quoted identifiers never
/// qualify, so the verb of `WITH x AS (SELECT ...) DELETE ...` is `DELETE`.
fn top_level_verb(sql: &str) -> Option<String> {
   let mut depth = 0u32;
   let mut quote: Option<char> = None;
   let mut word = String::new();

   // Trailing separator flushes the final word.
   for ch in sql.chars().chain(std::iter::once(';')) {
      if let Some(closing) = quote {
         if ch == closing {
            quote = None;
         }
         continue;
      }
      if ch.is_ascii_alphanumeric() || ch == '_' {
         if depth == 0 {
            word.push(ch.to_ascii_uppercase());
         }
         continue;
      }
      if depth == 0 && STATEMENT_VERBS.contains(&word.as_str()) {
         return Some(word);
      }
      word.clear();
      match ch {
         '(' => depth += 1,
         ')' => depth = depth.saturating_sub(1),
         '\'' | '"' | '`' => quote = Some(ch),
         '[' => quote = Some(']'),
         _ => {}
      }
   }
   None
}
