//! SQLite access layer for task-based async services.
//!
//! Layers a routing facade over two lower-level crates:
//!
//! - [`sqlx_sqlite_task_pool`] — bounded pool of physical connections with
//!   per-connection statement caching and transaction state tracking.
//! - [`sqlx_sqlite_stmt_cache`] — a shared read connection whose compiled
//!   statements are cached process-wide and keyed by query structure.
//!
//! ## Core Types
//!
//! - [`Database`] — the facade: reads, writes, keyed lookups, transactions.
//! - [`TaskId`] — explicit task identity threaded through every call.
//! - [`Row`] — one result row as an insertion-ordered JSON map.
//!
//! ## Usage
//!
//! ```ignore
//! use sqlite_task_db::{Database, DatabaseConfig, TaskId};
//!
//! let db = Database::connect(DatabaseConfig::new("app.db")).await?;
//! let task = TaskId::next();
//!
//! db.transaction(task, || async {
//!     db.execute(task, "INSERT INTO users (name) VALUES (?)", vec!["ada".into()]).await?;
//!     Ok(())
//! }).await?;
//!
//! let user = db.find_one(task, "users", db.last_insert_id(task).into()).await?;
//! ```

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

mod database;
mod decode;
mod error;
mod registry;

pub use database::{Database, MAX_TRACKED_INSERT_IDS};
pub use error::{Error, Result};
pub use registry::TaskId;

pub use sqlx_sqlite_stmt_cache::{CacheStats, Operator, QueryShape, ShapeFingerprint};
pub use sqlx_sqlite_task_pool::{DatabaseConfig, PoolConfig, PoolStats};

/// A single result row: column name to JSON value, in SELECT order.
pub type Row = IndexMap<String, JsonValue>;
