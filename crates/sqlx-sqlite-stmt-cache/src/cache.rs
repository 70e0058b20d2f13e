//! Process-wide cache of read statement handles, bounded with FIFO eviction.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use indexmap::IndexMap;
use sqlx_sqlite_task_pool::StatementHandle;
use tracing::debug;

use crate::fingerprint::ShapeFingerprint;

/// Default bound on cached statements.
pub const DEFAULT_MAX_CACHED_STATEMENTS: usize = 256;

/// Statistics reported by [`GlobalStatementCache::stats`].
#[derive(Debug, Clone)]
pub struct CacheStats {
   /// Number of cached statements.
   pub count: usize,
   /// Maximum number of cached statements before eviction.
   pub max: usize,
   /// Rough memory held by cached entries, in bytes.
   pub approx_memory: usize,
   /// Lookups served from the cache.
   pub hits: u64,
   /// Lookups that required preparation.
   pub misses: u64,
}

/// Bounded map from shape fingerprint to a statement handle on the shared
/// read connection.
///
/// Insertion order is preserved so eviction removes the oldest-inserted
/// entry first (simple FIFO, not strict LRU): hot shapes are re-inserted
/// rarely relative to steady-state traffic, so recency tracking on the hit
/// path is not worth the write contention. The read path takes a shared
/// lock only.
pub struct GlobalStatementCache {
   entries: RwLock<IndexMap<ShapeFingerprint, StatementHandle>>,
   max: AtomicUsize,
   hits: AtomicU64,
   misses: AtomicU64,
}

impl GlobalStatementCache {
   /// Cache bounded at `max` entries (0 falls back to the default bound).
   pub fn new(max: usize) -> Self {
      let max = if max == 0 { DEFAULT_MAX_CACHED_STATEMENTS } else { max };
      Self {
         entries: RwLock::new(IndexMap::new()),
         max: AtomicUsize::new(max),
         hits: AtomicU64::new(0),
         misses: AtomicU64::new(0),
      }
   }

   /// Look up a handle by fingerprint.
   pub fn get(&self, fingerprint: ShapeFingerprint) -> Option<StatementHandle> {
      let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
      match entries.get(&fingerprint) {
         Some(handle) => {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(handle.clone())
         }
         None => {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
         }
      }
   }

   /// Insert a handle, evicting oldest-inserted entries once full.
   pub fn insert(&self, fingerprint: ShapeFingerprint, handle: StatementHandle) {
      let max = self.max.load(Ordering::Relaxed);
      let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
      while entries.len() >= max {
         if let Some((evicted, _)) = entries.shift_remove_index(0) {
            debug!(fingerprint = evicted.as_u64(), "evicted oldest cached statement");
         } else {
            break;
         }
      }
      entries.insert(fingerprint, handle);
   }

   /// Number of cached statements.
   pub fn len(&self) -> usize {
      self
         .entries
         .read()
         .unwrap_or_else(PoisonError::into_inner)
         .len()
   }

   /// Whether the cache is empty.
   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Remove every cached statement.
   pub fn clear(&self) {
      self
         .entries
         .write()
         .unwrap_or_else(PoisonError::into_inner)
         .clear();
   }

   /// Change the bound, evicting oldest entries if the cache is over it.
   pub fn set_max(&self, max: usize) {
      let max = if max == 0 { DEFAULT_MAX_CACHED_STATEMENTS } else { max };
      self.max.store(max, Ordering::Relaxed);
      let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
      while entries.len() > max {
         entries.shift_remove_index(0);
      }
   }

   /// Snapshot of cache statistics.
   pub fn stats(&self) -> CacheStats {
      let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
      let approx_memory = entries.values().map(StatementHandle::approx_memory).sum();
      CacheStats {
         count: entries.len(),
         max: self.max.load(Ordering::Relaxed),
         approx_memory,
         hits: self.hits.load(Ordering::Relaxed),
         misses: self.misses.load(Ordering::Relaxed),
      }
   }
}

impl Default for GlobalStatementCache {
   fn default() -> Self {
      Self::new(DEFAULT_MAX_CACHED_STATEMENTS)
   }
}
