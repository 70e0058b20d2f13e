//! Integration tests for pool capacity, timeout, and recovery behavior.

use std::time::Duration;

use sqlx_sqlite_task_pool::{ConnectionPool, DatabaseConfig, Error, PoolConfig};

struct TestPool {
   pool: ConnectionPool,
   _temp_dir: tempfile::TempDir,
}

fn setup_pool(max_connections: u32) -> TestPool {
   let temp_dir = tempfile::TempDir::new().unwrap();
   let config = DatabaseConfig {
      pool: PoolConfig {
         max_connections,
         acquire_timeout: Duration::from_millis(100),
         ..Default::default()
      },
      ..DatabaseConfig::new(temp_dir.path().join("test.db"))
   };

   TestPool {
      pool: ConnectionPool::new(config),
      _temp_dir: temp_dir,
   }
}

// ============================================================================
// Capacity
// ============================================================================

#[tokio::test]
async fn test_acquire_creates_up_to_capacity() {
   let t = setup_pool(2);

   let a = t.pool.acquire().await.unwrap();
   let b = t.pool.acquire().await.unwrap();

   assert_eq!(t.pool.live_count(), 2);
   assert_eq!(t.pool.idle_count(), 0);

   drop(a);
   drop(b);
   assert_eq!(t.pool.live_count(), 2);
   assert_eq!(t.pool.idle_count(), 2);
}

#[tokio::test]
async fn test_acquire_reuses_idle_connection() {
   let t = setup_pool(2);

   let id = {
      let conn = t.pool.acquire().await.unwrap();
      conn.id()
   };

   let conn = t.pool.acquire().await.unwrap();
   assert_eq!(conn.id(), id);
   assert_eq!(t.pool.live_count(), 1);
}

#[tokio::test]
async fn test_exhausted_pool_times_out() {
   let t = setup_pool(2);

   let _a = t.pool.acquire().await.unwrap();
   let _b = t.pool.acquire().await.unwrap();

   let err = t
      .pool
      .acquire_timeout(Duration::from_millis(100))
      .await
      .err()
      .unwrap();

   assert!(matches!(err, Error::PoolExhausted { .. }));
   assert_eq!(t.pool.live_count(), 2);
   assert_eq!(t.pool.stats().timeouts, 1);
}

#[tokio::test]
async fn test_release_unblocks_waiter() {
   let t = setup_pool(2);

   let a = t.pool.acquire().await.unwrap();
   let _b = t.pool.acquire().await.unwrap();

   // Third acquisition times out while both are held
   let err = t
      .pool
      .acquire_timeout(Duration::from_millis(100))
      .await
      .err()
      .unwrap();
   assert!(matches!(err, Error::PoolExhausted { .. }));

   // Releasing one makes the retry succeed
   drop(a);
   let c = t.pool.acquire_timeout(Duration::from_secs(1)).await;
   assert!(c.is_ok());
   assert_eq!(t.pool.live_count(), 2);
}

#[tokio::test]
async fn test_blocked_acquirer_wakes_on_release() {
   let t = setup_pool(1);
   let held = t.pool.acquire().await.unwrap();

   let pool = t.pool.clone();
   let waiter = tokio::spawn(async move {
      pool.acquire_timeout(Duration::from_secs(5)).await.map(|g| g.id())
   });

   // Give the waiter time to block on the semaphore, then release.
   tokio::time::sleep(Duration::from_millis(50)).await;
   drop(held);

   let acquired = waiter.await.unwrap();
   assert!(acquired.is_ok());
   assert_eq!(t.pool.live_count(), 1);
}

// ============================================================================
// Prewarm
// ============================================================================

#[tokio::test]
async fn test_prewarm_fills_to_capacity() {
   let t = setup_pool(3);

   let elapsed = t.pool.prewarm().await.unwrap();
   assert_eq!(t.pool.live_count(), 3);
   assert_eq!(t.pool.idle_count(), 3);
   assert!(elapsed >= Duration::ZERO);

   // Acquisitions after prewarm reuse existing connections
   let _conn = t.pool.acquire().await.unwrap();
   assert_eq!(t.pool.live_count(), 3);
   assert_eq!(t.pool.idle_count(), 2);
}

#[tokio::test]
async fn test_prewarm_with_connection_checked_out() {
   let t = setup_pool(2);
   let held = t.pool.acquire().await.unwrap();

   // The checkout holds one permit, so prewarm only tops up the remainder
   t.pool.prewarm().await.unwrap();
   assert_eq!(t.pool.live_count(), 2);
   assert_eq!(t.pool.idle_count(), 1);

   drop(held);
   assert_eq!(t.pool.live_count(), 2);
   assert_eq!(t.pool.idle_count(), 2);

   // Permits taken during prewarm were all released
   let _a = t.pool.acquire().await.unwrap();
   let _b = t.pool.acquire().await.unwrap();
   assert_eq!(t.pool.live_count(), 2);
}

// ============================================================================
// Broken-connection replacement
// ============================================================================

#[tokio::test]
async fn test_broken_idle_connection_replaced_transparently() {
   let t = setup_pool(2);

   let broken_id = {
      let mut conn = t.pool.acquire().await.unwrap();
      conn.mark_broken();
      conn.id()
      // Drop discards the broken connection instead of parking it
   };

   assert_eq!(t.pool.live_count(), 0);
   assert_eq!(t.pool.stats().replaced, 1);

   // The caller sees a fresh live connection, never an error
   let conn = t.pool.acquire().await.unwrap();
   assert_ne!(conn.id(), broken_id);
   assert!(!conn.is_broken());
}

#[tokio::test]
async fn test_mid_transaction_connection_not_parked() {
   let t = setup_pool(2);

   {
      let mut conn = t.pool.acquire().await.unwrap();
      conn
         .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![])
         .await
         .unwrap();
      conn.begin().await.unwrap();
      // Guard dropped with the transaction still open
   }

   // The connection was discarded, not returned to the idle queue
   assert_eq!(t.pool.idle_count(), 0);
   assert_eq!(t.pool.live_count(), 0);
}

// ============================================================================
// Close
// ============================================================================

#[tokio::test]
async fn test_closed_pool_rejects_acquire() {
   let t = setup_pool(2);
   t.pool.prewarm().await.unwrap();

   t.pool.close().await;

   let err = t.pool.acquire().await.err().unwrap();
   assert!(matches!(err, Error::PoolClosed));
   assert_eq!(t.pool.live_count(), 0);
}
