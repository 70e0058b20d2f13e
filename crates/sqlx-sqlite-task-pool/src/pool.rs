//! Bounded pool of physical connections with liveness-checked acquisition.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::connection::PhysicalConnection;
use crate::{Error, Result};

/// Observable pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
   /// Current number of live connections (idle + checked out).
   pub live: u32,
   /// Current number of idle connections.
   pub idle: u32,
   /// Pool capacity.
   pub capacity: u32,
   /// Total number of successful checkouts.
   pub checkouts: u64,
   /// Number of acquisitions that timed out.
   pub timeouts: u64,
   /// Number of broken connections discarded and replaced.
   pub replaced: u64,
}

struct PoolInner {
   config: DatabaseConfig,
   capacity: u32,
   semaphore: Arc<Semaphore>,
   idle: Mutex<VecDeque<PhysicalConnection>>,
   live: AtomicU32,
   closed: AtomicBool,
   checkouts: AtomicU64,
   timeouts: AtomicU64,
   replaced: AtomicU64,
}

impl PoolInner {
   fn idle_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<PhysicalConnection>> {
      self.idle.lock().unwrap_or_else(PoisonError::into_inner)
   }

   fn discard(&self, conn: PhysicalConnection) {
      self.live.fetch_sub(1, Ordering::SeqCst);
      self.replaced.fetch_add(1, Ordering::Relaxed);
      debug!(connection_id = conn.id(), "discarding connection");
      // Dropping closes the underlying session; an open transaction on a
      // discarded connection rolls back with it.
      drop(conn);
   }
}

/// Bounded collection of [`PhysicalConnection`]s.
///
/// ## Capacity
///
/// The pool never holds more live connections than its configured size.
/// Capacity is enforced with a semaphore: a checkout holds one permit for
/// as long as the caller holds the [`PooledConnection`], so N concurrent
/// acquisitions against capacity N leave the N+1th caller blocked until a
/// release or its timeout.
///
/// ## Health
///
/// Idle connections are liveness-probed before handout. A connection that
/// fails its probe is silently discarded and replaced within the caller's
/// timeout budget; the caller only ever sees a live connection or a typed
/// exhaustion error.
pub struct ConnectionPool {
   inner: Arc<PoolInner>,
}

impl ConnectionPool {
   /// Create a pool for the configured database.
   ///
   /// Connections are created lazily on first acquisition unless
   /// [`prewarm`](Self::prewarm) is called.
   pub fn new(config: DatabaseConfig) -> Self {
      let capacity = config.pool.effective_size();
      Self {
         inner: Arc::new(PoolInner {
            config,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            idle: Mutex::new(VecDeque::with_capacity(capacity as usize)),
            live: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            checkouts: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
         }),
      }
   }

   /// Pool capacity.
   pub fn capacity(&self) -> u32 {
      self.inner.capacity
   }

   /// Current number of live connections (idle + checked out).
   pub fn live_count(&self) -> u32 {
      self.inner.live.load(Ordering::SeqCst)
   }

   /// Current number of idle connections.
   pub fn idle_count(&self) -> u32 {
      self.inner.idle_queue().len() as u32
   }

   /// Snapshot of pool statistics.
   pub fn stats(&self) -> PoolStats {
      PoolStats {
         live: self.live_count(),
         idle: self.idle_count(),
         capacity: self.inner.capacity,
         checkouts: self.inner.checkouts.load(Ordering::Relaxed),
         timeouts: self.inner.timeouts.load(Ordering::Relaxed),
         replaced: self.inner.replaced.load(Ordering::Relaxed),
      }
   }

   /// Fill the pool to capacity before serving traffic.
   ///
   /// Avoids cold-start latency on the first real requests. Returns the
   /// elapsed time so callers can report startup cost.
   pub async fn prewarm(&self) -> Result<Duration> {
      let started = Instant::now();

      // Hold a permit for every connection this call may create. An
      // acquirer with a connect in flight still holds its own permit, so
      // creations reserved here plus in-flight checkouts can never sum
      // past capacity.
      let mut permits = Vec::new();
      while let Ok(permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() {
         permits.push(permit);
      }

      for _ in 0..permits.len() {
         if self.live_count() >= self.inner.capacity {
            break;
         }
         let conn = PhysicalConnection::connect(&self.inner.config).await?;
         self.inner.live.fetch_add(1, Ordering::SeqCst);
         self.inner.idle_queue().push_back(conn);
      }
      drop(permits);

      let elapsed = started.elapsed();
      info!(
         connections = self.live_count(),
         elapsed_ms = elapsed.as_millis() as u64,
         "pool prewarmed"
      );
      Ok(elapsed)
   }

   /// Acquire a connection using the configured timeout.
   pub async fn acquire(&self) -> Result<PooledConnection> {
      self.acquire_timeout(self.inner.config.pool.acquire_timeout).await
   }

   /// Acquire a connection, waiting up to `timeout` for capacity.
   ///
   /// Resolution order: reuse an idle connection that passes its liveness
   /// probe, else create a new one while under capacity, else block until
   /// a release or the timeout elapses. Timeout reports
   /// [`Error::PoolExhausted`]; broken idle connections are replaced
   /// transparently within the same timeout budget.
   pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
      if self.inner.closed.load(Ordering::SeqCst) {
         return Err(Error::PoolClosed);
      }

      let started = Instant::now();
      let permit = match tokio::time::timeout(
         timeout,
         Arc::clone(&self.inner.semaphore).acquire_owned(),
      )
      .await
      {
         Ok(Ok(permit)) => permit,
         Ok(Err(_)) => return Err(Error::PoolClosed),
         Err(_) => {
            self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(Error::PoolExhausted {
               waited: started.elapsed(),
            });
         }
      };

      // Permit in hand: capacity is reserved for us until the guard drops.
      loop {
         let candidate = self.inner.idle_queue().pop_front();
         match candidate {
            Some(mut conn) => {
               if conn.ping().await {
                  return Ok(self.checkout(conn, permit));
               }
               // Failed its probe while idle: replace it and keep going.
               warn!(connection_id = conn.id(), "replacing broken idle connection");
               self.inner.discard(conn);
            }
            None => {
               let conn = PhysicalConnection::connect(&self.inner.config).await?;
               self.inner.live.fetch_add(1, Ordering::SeqCst);
               return Ok(self.checkout(conn, permit));
            }
         }

         // Bound cascading-failure retries by the caller's overall budget.
         if started.elapsed() >= timeout {
            self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(Error::PoolExhausted {
               waited: started.elapsed(),
            });
         }
      }
   }

   fn checkout(&self, conn: PhysicalConnection, permit: OwnedSemaphorePermit) -> PooledConnection {
      self.inner.checkouts.fetch_add(1, Ordering::Relaxed);
      PooledConnection {
         conn: Some(conn),
         pool: Arc::clone(&self.inner),
         _permit: permit,
      }
   }

   /// Close the pool and all idle connections.
   ///
   /// Checked-out connections are closed as their guards drop.
   pub async fn close(&self) {
      self.inner.closed.store(true, Ordering::SeqCst);
      self.inner.semaphore.close();

      loop {
         let conn = self.inner.idle_queue().pop_front();
         match conn {
            Some(conn) => {
               self.inner.live.fetch_sub(1, Ordering::SeqCst);
               if let Err(e) = conn.close().await {
                  debug!(error = %e, "error closing idle connection");
               }
            }
            None => break,
         }
      }
   }
}

impl Clone for ConnectionPool {
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

/// RAII guard for a checked-out connection.
///
/// Dereferences to [`PhysicalConnection`]. Dropping the guard returns the
/// connection to the idle queue and wakes one blocked acquirer. Broken or
/// mid-transaction connections are discarded on drop instead of being
/// returned, so the idle queue only ever holds clean sessions.
#[must_use = "if unused, the connection is immediately returned to the pool"]
pub struct PooledConnection {
   conn: Option<PhysicalConnection>,
   pool: Arc<PoolInner>,
   _permit: OwnedSemaphorePermit,
}

impl Drop for PooledConnection {
   fn drop(&mut self) {
      if let Some(conn) = self.conn.take() {
         if conn.is_broken() || conn.in_transaction() || self.pool.closed.load(Ordering::SeqCst) {
            self.pool.discard(conn);
         } else {
            self.pool.idle_queue().push_back(conn);
         }
      }
      // The permit drops after the connection is back in the queue, so a
      // woken waiter always finds it there.
   }
}

impl Deref for PooledConnection {
   type Target = PhysicalConnection;

   fn deref(&self) -> &Self::Target {
      self.conn.as_ref().expect("connection already returned")
   }
}

impl DerefMut for PooledConnection {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.conn.as_mut().expect("connection already returned")
   }
}
