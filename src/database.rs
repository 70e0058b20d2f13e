//! Query routing facade: the single entry point deciding, per operation,
//! which connection and which statement cache to use.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use serde_json::json;
use sqlx_sqlite_stmt_cache::{
   CacheStats, Operator, QueryShape, ShapeFingerprint, SingletonReadConnection,
   is_read_statement,
};
use sqlx_sqlite_task_pool::{ConnectionPool, DatabaseConfig, PoolStats};
use tracing::debug;

use crate::decode::decode_rows;
use crate::registry::ConnectionRegistry;
use crate::{Error, Result, Row, TaskId};

/// The database facade.
///
/// ## Routing policy
///
/// - **Plain reads** go to the shared read connection and its global
///   statement cache — unless the calling task has a transaction open, in
///   which case they use that task's bound connection so they observe the
///   transaction's uncommitted writes and isolation level.
/// - **Writes outside a transaction** check a connection out of the pool
///   for the duration of one statement, then release it.
/// - **[`transaction`](Database::transaction)** binds one pooled connection
///   to the calling task; every nested call from that task routes to the
///   bound connection until commit or rollback.
/// - Non-read SQL handed to the read entry points routes to a pooled
///   connection, never the shared reader.
///
/// All process-wide state (the pool, the global cache, the task registry)
/// is owned by this object; there are no ambient globals.
/// Bound on per-task insert-id bookkeeping.
///
/// Tasks are numerous and short-lived, so the map evicts its oldest entry
/// once this bound is reached rather than growing without limit. Callers
/// that want deterministic cleanup use [`Database::forget_task`] when a
/// task ends.
pub const MAX_TRACKED_INSERT_IDS: usize = 1024;

pub struct Database {
   pool: ConnectionPool,
   reader: SingletonReadConnection,
   registry: ConnectionRegistry,
   last_insert_ids: Mutex<IndexMap<TaskId, i64>>,
}

impl Database {
   /// Connect to the configured database.
   ///
   /// Opens the shared read connection eagerly and, when configured,
   /// prewarms the pool to capacity before returning.
   pub async fn connect(config: DatabaseConfig) -> Result<Self> {
      let reader =
         SingletonReadConnection::connect(config.clone(), config.max_cached_statements).await?;
      let pool = ConnectionPool::new(config.clone());
      if config.pool.prewarm {
         pool.prewarm().await?;
      }

      Ok(Self {
         pool,
         reader,
         registry: ConnectionRegistry::new(),
         last_insert_ids: Mutex::new(IndexMap::new()),
      })
   }

   // =========================================================================
   // Raw SQL
   // =========================================================================

   /// Execute a read query and return all matching rows.
   pub async fn query(&self, task: TaskId, sql: &str, params: Vec<JsonValue>) -> Result<Vec<Row>> {
      // A task with an open transaction must read through its bound
      // connection to see its own uncommitted writes.
      if let Some(slot) = self.registry.get(task) {
         let mut conn = slot.lock().await;
         let rows = conn.fetch_all(sql, params).await?;
         return decode_rows(rows);
      }

      if is_read_statement(sql) {
         let rows = self
            .reader
            .query(ShapeFingerprint::of_text(sql), || sql.to_string(), params)
            .await?;
         return decode_rows(rows);
      }

      // Statements with side effects (or RETURNING clauses) never touch the
      // shared reader.
      let mut conn = self.pool.acquire().await?;
      let rows = conn.fetch_all(sql, params).await?;
      decode_rows(rows)
   }

   /// Execute a read query expecting at most one row.
   pub async fn query_one(
      &self,
      task: TaskId,
      sql: &str,
      params: Vec<JsonValue>,
   ) -> Result<Option<Row>> {
      let mut rows = self.query(task, sql, params).await?;
      if rows.len() > 1 {
         rows.truncate(1);
      }
      Ok(rows.pop())
   }

   /// Execute a write statement and return the number of affected rows.
   ///
   /// Inside a transaction the statement runs on the task's bound
   /// connection; otherwise a pooled connection is held for this one
   /// statement and released immediately.
   pub async fn execute(&self, task: TaskId, sql: &str, params: Vec<JsonValue>) -> Result<u64> {
      let result = if let Some(slot) = self.registry.get(task) {
         let mut conn = slot.lock().await;
         conn.execute(sql, params).await?
      } else {
         let mut conn = self.pool.acquire().await?;
         conn.execute(sql, params).await?
      };

      if result.last_insert_id != 0 {
         let mut ids = self
            .last_insert_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
         // Re-inserting moves the task to the back so active writers are
         // not the first evicted.
         ids.shift_remove(&task);
         while ids.len() >= MAX_TRACKED_INSERT_IDS {
            ids.shift_remove_index(0);
         }
         ids.insert(task, result.last_insert_id);
      }
      Ok(result.rows_affected)
   }

   /// The row id of this task's most recent successful insert, or 0 if the
   /// task has not inserted anything.
   pub fn last_insert_id(&self, task: TaskId) -> i64 {
      self
         .last_insert_ids
         .lock()
         .unwrap_or_else(PoisonError::into_inner)
         .get(&task)
         .copied()
         .unwrap_or(0)
   }

   /// Drop bookkeeping retained for a completed task.
   ///
   /// Call when a task's logical work ends so its last-insert id does not
   /// linger until the tracking bound evicts it. Has no effect on an open
   /// transaction binding.
   pub fn forget_task(&self, task: TaskId) {
      self
         .last_insert_ids
         .lock()
         .unwrap_or_else(PoisonError::into_inner)
         .shift_remove(&task);
   }

   // =========================================================================
   // Keyed lookups
   // =========================================================================

   /// Fetch one row from `table` by its `id` column.
   pub async fn find_one(&self, task: TaskId, table: &str, key: JsonValue) -> Result<Option<Row>> {
      self.find_one_by(task, table, "id", key).await
   }

   /// Fetch one row from `table` where `key_column` equals `key`.
   pub async fn find_one_by(
      &self,
      task: TaskId,
      table: &str,
      key_column: &str,
      key: JsonValue,
   ) -> Result<Option<Row>> {
      validate_identifier(table)?;
      validate_identifier(key_column)?;

      let shape = QueryShape::select(table)
         .where_col(key_column, Operator::Eq)
         .with_limit();
      let params = vec![key, json!(1)];

      let mut rows = self.run_shape(task, &shape, params).await?;
      Ok(rows.pop())
   }

   /// Fetch all rows from `table` whose `id` is in `keys`.
   pub async fn find_many(
      &self,
      task: TaskId,
      table: &str,
      keys: Vec<JsonValue>,
   ) -> Result<Vec<Row>> {
      self.find_many_by(task, table, "id", keys).await
   }

   /// Fetch all rows where `key_column` is in `keys`, as a single IN query
   /// sized to the key count.
   ///
   /// Empty `keys` short-circuits to an empty result without issuing any
   /// statement.
   pub async fn find_many_by(
      &self,
      task: TaskId,
      table: &str,
      key_column: &str,
      keys: Vec<JsonValue>,
   ) -> Result<Vec<Row>> {
      validate_identifier(table)?;
      validate_identifier(key_column)?;

      if keys.is_empty() {
         return Ok(Vec::new());
      }

      let shape = QueryShape::select(table).where_col(key_column, Operator::In(keys.len()));
      self.run_shape(task, &shape, keys).await
   }

   /// Fetch rows for many distinct keys by executing one cached `=`
   /// statement once per key.
   ///
   /// Appropriate when keys target heterogeneous entities rather than a
   /// single IN-set: every execution reuses the same compiled statement
   /// regardless of key count.
   pub async fn batch_fetch(
      &self,
      task: TaskId,
      table: &str,
      keys: Vec<JsonValue>,
   ) -> Result<Vec<Row>> {
      self.batch_fetch_by(task, table, "id", keys).await
   }

   /// Like [`batch_fetch`](Self::batch_fetch) with an explicit key column.
   pub async fn batch_fetch_by(
      &self,
      task: TaskId,
      table: &str,
      key_column: &str,
      keys: Vec<JsonValue>,
   ) -> Result<Vec<Row>> {
      validate_identifier(table)?;
      validate_identifier(key_column)?;

      if keys.is_empty() {
         return Ok(Vec::new());
      }

      let shape = QueryShape::select(table).where_col(key_column, Operator::Eq);

      if let Some(slot) = self.registry.get(task) {
         let mut conn = slot.lock().await;
         let sql = shape.sql();
         conn.prepare_keyed(shape.fingerprint().as_u64(), &sql).await?;
         let mut out = Vec::new();
         for key in keys {
            out.extend(decode_rows(conn.fetch_all(&sql, vec![key]).await?)?);
         }
         return Ok(out);
      }

      let handle = self
         .reader
         .get_or_prepare(shape.fingerprint(), || shape.sql())
         .await?;
      let mut out = Vec::new();
      for key in keys {
         out.extend(decode_rows(self.reader.execute(&handle, vec![key]).await?)?);
      }
      Ok(out)
   }

   /// Run a shaped read on the right connection for this task.
   async fn run_shape(
      &self,
      task: TaskId,
      shape: &QueryShape,
      params: Vec<JsonValue>,
   ) -> Result<Vec<Row>> {
      if let Some(slot) = self.registry.get(task) {
         let mut conn = slot.lock().await;
         let sql = shape.sql();
         // Cache on the bound connection under the same structural key.
         conn.prepare_keyed(shape.fingerprint().as_u64(), &sql).await?;
         let rows = conn.fetch_all(&sql, params).await?;
         return decode_rows(rows);
      }

      let rows = self
         .reader
         .query(shape.fingerprint(), || shape.sql(), params)
         .await?;
      decode_rows(rows)
   }

   // =========================================================================
   // Transactions
   // =========================================================================

   /// Run `work` inside a transaction on one connection bound to `task`.
   ///
   /// Every facade call made by `work` with the same task id routes to the
   /// bound connection. Commits on success; rolls back before propagating
   /// any failure, so callers never observe a half-committed state. A
   /// nested call for a task that already holds a transaction reports
   /// [`Error::TransactionConflict`] and leaves the outer transaction open.
   pub async fn transaction<T, F, Fut>(&self, task: TaskId, work: F) -> Result<T>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      if self.registry.is_bound(task) {
         return Err(Error::TransactionConflict(task));
      }

      let conn = self.pool.acquire().await?;
      let slot = self.registry.bind(task, conn)?;

      {
         let mut conn = slot.lock().await;
         if let Err(e) = conn.begin().await {
            drop(conn);
            self.registry.unbind(task);
            return Err(e.into());
         }
      }
      debug!(task = %task, "transaction started");

      let result = work().await;

      let outcome = match result {
         Ok(value) => {
            let mut conn = slot.lock().await;
            match conn.commit().await {
               Ok(()) => Ok(value),
               Err(commit_err) => {
                  // Compensate before propagating; rollback is a no-op if
                  // the failed commit already ended the transaction.
                  match conn.rollback().await {
                     Ok(()) => Err(commit_err.into()),
                     Err(rollback_err) => Err(Error::TransactionRollbackFailed {
                        transaction_error: commit_err.to_string(),
                        rollback_error: rollback_err.to_string(),
                     }),
                  }
               }
            }
         }
         Err(work_err) => {
            let mut conn = slot.lock().await;
            match conn.rollback().await {
               Ok(()) => Err(work_err),
               Err(rollback_err) => Err(Error::TransactionRollbackFailed {
                  transaction_error: work_err.to_string(),
                  rollback_error: rollback_err.to_string(),
               }),
            }
         }
      };

      // Removed exactly once; dropping the binding releases the connection.
      self.registry.unbind(task);
      outcome
   }

   /// Whether `task` currently has an open transaction.
   pub fn in_transaction(&self, task: TaskId) -> bool {
      self.registry.is_bound(task)
   }

   /// Number of tasks with an open transaction.
   pub fn active_transactions(&self) -> usize {
      self.registry.active_count()
   }

   // =========================================================================
   // Administration
   // =========================================================================

   /// Statistics for the global read statement cache.
   pub fn cache_stats(&self) -> CacheStats {
      self.reader.cache().stats()
   }

   /// Drop every cached read statement.
   pub fn clear_cache(&self) {
      self.reader.cache().clear();
   }

   /// Change the bound on cached read statements, evicting down if needed.
   pub fn set_max_cached_statements(&self, max: usize) {
      self.reader.cache().set_max(max);
   }

   /// Statistics for the connection pool.
   pub fn pool_stats(&self) -> PoolStats {
      self.pool.stats()
   }

   /// Fill the pool to capacity, reporting elapsed time.
   pub async fn prewarm(&self) -> Result<std::time::Duration> {
      Ok(self.pool.prewarm().await?)
   }

   /// Close the pool and the shared read connection.
   pub async fn close(self) -> Result<()> {
      self.pool.close().await;
      self.reader.close().await?;
      Ok(())
   }
}

/// Validate a table or column identifier before it is spliced into SQL.
fn validate_identifier(name: &str) -> Result<()> {
   let mut chars = name.chars();
   let first_ok = chars
      .next()
      .map(|c| c.is_ascii_alphabetic() || c == '_')
      .unwrap_or(false);
   let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

   if first_ok && rest_ok {
      Ok(())
   } else {
      Err(Error::InvalidIdentifier(name.to_string()))
   }
}
