//! Integration tests for the shared read connection and global cache.

use serde_json::json;
use sqlx::Row;
use sqlx_sqlite_stmt_cache::{
   Error, Operator, QueryShape, ShapeFingerprint, SingletonReadConnection,
};
use sqlx_sqlite_task_pool::{DatabaseConfig, PhysicalConnection};

struct TestReader {
   reader: SingletonReadConnection,
   _temp_dir: tempfile::TempDir,
}

async fn setup_reader() -> TestReader {
   let temp_dir = tempfile::TempDir::new().unwrap();
   let config = DatabaseConfig::new(temp_dir.path().join("test.db"));

   // Seed the database through a throwaway writer
   let mut writer = PhysicalConnection::connect(&config).await.unwrap();
   writer
      .execute(
         "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)",
         vec![],
      )
      .await
      .unwrap();
   writer
      .execute(
         "INSERT INTO users (id, name, age) VALUES (1, 'Alice', 30), (2, 'Bob', 40), (3, 'Carol', 50)",
         vec![],
      )
      .await
      .unwrap();
   writer.close().await.unwrap();

   let reader = SingletonReadConnection::connect(config, 16).await.unwrap();
   TestReader {
      reader,
      _temp_dir: temp_dir,
   }
}

// ============================================================================
// Cache hit/miss behavior
// ============================================================================

#[tokio::test]
async fn test_same_shape_prepares_once() {
   let t = setup_reader().await;
   let shape = QueryShape::select("users").where_col("id", Operator::Eq);
   let fingerprint = shape.fingerprint();

   // Two different parameter sets, one compiled statement
   let first = t
      .reader
      .get_or_prepare(fingerprint, || shape.sql())
      .await
      .unwrap();
   let rows = t.reader.execute(&first, vec![json!(1)]).await.unwrap();
   assert_eq!(rows.len(), 1);

   let second = t
      .reader
      .get_or_prepare(fingerprint, || shape.sql())
      .await
      .unwrap();
   let rows = t.reader.execute(&second, vec![json!(2)]).await.unwrap();
   assert_eq!(rows.len(), 1);

   assert_eq!(first.fingerprint(), second.fingerprint());
   assert_eq!(first.connection_id(), second.connection_id());
   assert_eq!(t.reader.prepare_count().await, 1);
   assert_eq!(t.reader.cache().stats().count, 1);
}

#[tokio::test]
async fn test_different_shapes_cached_separately() {
   let t = setup_reader().await;
   let by_id = QueryShape::select("users").where_col("id", Operator::Eq);
   let by_age = QueryShape::select("users").where_col("age", Operator::Gt);

   t.reader
      .get_or_prepare(by_id.fingerprint(), || by_id.sql())
      .await
      .unwrap();
   t.reader
      .get_or_prepare(by_age.fingerprint(), || by_age.sql())
      .await
      .unwrap();

   assert_eq!(t.reader.cache().stats().count, 2);
   assert_eq!(t.reader.prepare_count().await, 2);
}

#[tokio::test]
async fn test_query_combines_prepare_and_execute() {
   let t = setup_reader().await;
   let shape = QueryShape::select("users")
      .columns(["name"])
      .where_col("age", Operator::Ge)
      .order_by("id");
   let fingerprint = shape.fingerprint();

   let rows = t
      .reader
      .query(fingerprint, || shape.sql(), vec![json!(40)])
      .await
      .unwrap();
   assert_eq!(rows.len(), 2);
   let name: String = rows[0].get("name");
   assert_eq!(name, "Bob");

   // Second call is a pure cache hit
   let rows = t
      .reader
      .query(fingerprint, || shape.sql(), vec![json!(50)])
      .await
      .unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(t.reader.prepare_count().await, 1);

   let stats = t.reader.cache().stats();
   assert_eq!(stats.count, 1);
   assert_eq!(stats.hits, 1);
}

// ============================================================================
// Eviction
// ============================================================================

#[tokio::test]
async fn test_fifo_eviction_at_capacity() {
   let temp_dir = tempfile::TempDir::new().unwrap();
   let config = DatabaseConfig::new(temp_dir.path().join("test.db"));
   let mut writer = PhysicalConnection::connect(&config).await.unwrap();
   writer
      .execute("CREATE TABLE t (a INT, b INT, c INT)", vec![])
      .await
      .unwrap();
   writer.close().await.unwrap();

   let reader = SingletonReadConnection::connect(config, 2).await.unwrap();
   let shapes: Vec<QueryShape> = ["a", "b", "c"]
      .iter()
      .map(|col| QueryShape::select("t").columns([*col]))
      .collect();

   for shape in &shapes {
      reader
         .get_or_prepare(shape.fingerprint(), || shape.sql())
         .await
         .unwrap();
   }

   // Oldest-inserted shape was evicted
   let stats = reader.cache().stats();
   assert_eq!(stats.count, 2);
   assert!(reader.cache().get(shapes[0].fingerprint()).is_none());
   assert!(reader.cache().get(shapes[2].fingerprint()).is_some());
}

#[tokio::test]
async fn test_set_max_shrinks_cache() {
   let t = setup_reader().await;

   for col in ["id", "name", "age"] {
      let shape = QueryShape::select("users").columns([col]);
      t.reader
         .get_or_prepare(shape.fingerprint(), || shape.sql())
         .await
         .unwrap();
   }
   assert_eq!(t.reader.cache().stats().count, 3);

   t.reader.cache().set_max(1);
   let stats = t.reader.cache().stats();
   assert_eq!(stats.count, 1);
   assert_eq!(stats.max, 1);
}

#[tokio::test]
async fn test_clear_empties_cache() {
   let t = setup_reader().await;
   let shape = QueryShape::select("users");
   t.reader
      .get_or_prepare(shape.fingerprint(), || shape.sql())
      .await
      .unwrap();

   t.reader.cache().clear();
   assert!(t.reader.cache().is_empty());
   assert_eq!(t.reader.cache().stats().approx_memory, 0);
}

// ============================================================================
// Eligibility
// ============================================================================

#[tokio::test]
async fn test_mutating_cte_rejected() {
   let t = setup_reader().await;
   let sql = "WITH x AS (SELECT 1 AS v) INSERT INTO users (name, age) SELECT 'mallory', v FROM x";
   let err = t
      .reader
      .query(ShapeFingerprint::of_text(sql), || sql.to_string(), vec![])
      .await
      .err()
      .unwrap();

   assert!(matches!(err, Error::NotReadOnly(_)));
   assert!(t.reader.cache().is_empty());

   // Nothing was written through the shared session
   let check = QueryShape::select("users");
   let rows = t
      .reader
      .query(check.fingerprint(), || check.sql(), vec![])
      .await
      .unwrap();
   assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_write_statement_rejected() {
   let t = setup_reader().await;
   let sql = "DELETE FROM users";
   let err = t
      .reader
      .get_or_prepare(ShapeFingerprint::of_text(sql), || sql.to_string())
      .await
      .unwrap_err();

   assert!(matches!(err, Error::NotReadOnly(_)));
   assert!(t.reader.cache().is_empty());
}

// ============================================================================
// Concurrent access
// ============================================================================

#[tokio::test]
async fn test_many_tasks_share_one_statement() {
   let t = setup_reader().await;
   let reader = std::sync::Arc::new(t.reader);
   let shape = QueryShape::select("users").where_col("id", Operator::Eq);
   let fingerprint = shape.fingerprint();

   let mut handles = Vec::new();
   for i in 0..16u8 {
      let reader = std::sync::Arc::clone(&reader);
      let sql = shape.sql();
      handles.push(tokio::spawn(async move {
         reader
            .query(fingerprint, move || sql, vec![json!(i % 3 + 1)])
            .await
            .map(|rows| rows.len())
      }));
   }

   for handle in handles {
      assert_eq!(handle.await.unwrap().unwrap(), 1);
   }

   // All sixteen executions shared one compiled statement
   assert_eq!(reader.prepare_count().await, 1);
   assert_eq!(reader.cache().stats().count, 1);
}
