//! # sqlx-sqlite-task-pool
//!
//! A bounded SQLite connection pool over SQLx for runtimes where many
//! short-lived tasks share a small number of expensive sessions.
//!
//! ## Core Types
//!
//! - **[`PhysicalConnection`]**: One live session with a local statement cache
//!   and explicit transaction state
//! - **[`ConnectionPool`]**: Bounded pool with blocking-with-timeout
//!   acquisition, liveness-checked handout, and optional prewarming
//! - **[`PooledConnection`]**: RAII guard returning the connection on drop
//! - **[`DatabaseConfig`]** / **[`PoolConfig`]**: Session and pool settings
//! - **[`Error`]**: Error type for pool and connection operations
//!
//! ## Architecture
//!
//! - **Capacity as permits**: a semaphore bounds live connections; holding a
//!   guard holds a permit, so the pool can never exceed its configured size
//! - **Health-checked handout**: idle connections are probed before reuse and
//!   broken ones replaced silently within the caller's timeout budget
//! - **Local statement caches**: each connection reuses compiled statements
//!   keyed by SQL text hash, bounded with oldest-first eviction

mod config;
mod connection;
mod error;
mod pool;

// Re-export public types
pub use config::{DatabaseConfig, PoolConfig};
pub use connection::{PhysicalConnection, StatementHandle, WriteResult, bind_value};
pub use error::{Error, Result};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
