//! Per-task binding of transactional connections.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use sqlx_sqlite_task_pool::PooledConnection;
use tracing::debug;

use crate::{Error, Result};

/// Identity of one logical task.
///
/// Task identity is an explicit parameter threaded through the facade, not
/// an ambient global lookup: identifiers obtained from a runtime can be
/// reused after task completion, and an explicit id keeps routing testable.
/// Use [`TaskId::next`] for a process-unique id, or wrap your runtime's own
/// identifier with [`TaskId::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// Process-wide counter backing [`TaskId::next`].
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
   /// Wrap an externally supplied task identifier.
   pub fn new(id: u64) -> Self {
      Self(id)
   }

   /// A fresh process-unique task identifier.
   pub fn next() -> Self {
      Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
   }

   /// The raw identifier.
   pub fn as_u64(&self) -> u64 {
      self.0
   }
}

impl fmt::Display for TaskId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.0)
   }
}

/// Map from task identity to the connection bound to its open transaction.
///
/// A binding exists only while the task holds a checked-out connection; it
/// is removed exactly once at end of transaction, and dropping the removed
/// binding returns the connection to the pool. Concurrent tasks never
/// contend on each other's entries, only on the map itself during
/// insert/remove.
pub(crate) struct ConnectionRegistry {
   bindings: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<PooledConnection>>>>,
}

impl ConnectionRegistry {
   pub fn new() -> Self {
      Self {
         bindings: Mutex::new(HashMap::new()),
      }
   }

   /// Bind a connection to a task for the duration of its transaction.
   ///
   /// Ensures at most one binding per task using the Entry API; a second
   /// bind for the same task reports a transaction conflict and leaves the
   /// existing binding untouched.
   pub fn bind(
      &self,
      task: TaskId,
      conn: PooledConnection,
   ) -> Result<Arc<tokio::sync::Mutex<PooledConnection>>> {
      use std::collections::hash_map::Entry;
      let mut bindings = self.lock();

      match bindings.entry(task) {
         Entry::Vacant(e) => {
            let slot = Arc::new(tokio::sync::Mutex::new(conn));
            e.insert(Arc::clone(&slot));
            debug!(task = %task, "bound connection to task");
            Ok(slot)
         }
         Entry::Occupied(_) => Err(Error::TransactionConflict(task)),
      }
   }

   /// The connection bound to this task, if any.
   pub fn get(&self, task: TaskId) -> Option<Arc<tokio::sync::Mutex<PooledConnection>>> {
      self.lock().get(&task).map(Arc::clone)
   }

   /// Whether this task currently holds a bound connection.
   pub fn is_bound(&self, task: TaskId) -> bool {
      self.lock().contains_key(&task)
   }

   /// Remove a task's binding. Dropping the returned slot releases the
   /// connection back to its pool.
   pub fn unbind(&self, task: TaskId) -> Option<Arc<tokio::sync::Mutex<PooledConnection>>> {
      let removed = self.lock().remove(&task);
      if removed.is_some() {
         debug!(task = %task, "unbound connection from task");
      }
      removed
   }

   /// Number of tasks currently bound to a connection.
   pub fn active_count(&self) -> usize {
      self.lock().len()
   }

   fn lock(
      &self,
   ) -> std::sync::MutexGuard<'_, HashMap<TaskId, Arc<tokio::sync::Mutex<PooledConnection>>>> {
      self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
   }
}
