//! # sqlx-sqlite-stmt-cache
//!
//! Statement-shape fingerprinting and a process-wide read statement cache
//! over a single shared SQLite connection.
//!
//! ## Core Types
//!
//! - **[`QueryShape`]** / **[`ShapeFingerprint`]**: Structural identity of a
//!   query, independent of literal bound values
//! - **[`GlobalStatementCache`]**: Bounded fingerprint → handle map with
//!   oldest-first eviction
//! - **[`SingletonReadConnection`]**: One long-lived session serving every
//!   task's read-only statements, internally serialized
//! - **[`Error`]**: Error type for read-path operations
//!
//! ## Architecture
//!
//! - **Prepare once, execute anywhere**: any task can execute a statement
//!   another task prepared, because all cached handles bind to the one
//!   shared session
//! - **Values never key the cache**: two queries differing only in bound
//!   values share one compiled statement
//! - **FIFO eviction**: the cache is bounded and drops the oldest-inserted
//!   entry first; an evicted entry is fully removed, never left dangling

mod cache;
mod error;
mod fingerprint;
mod reader;

// Re-export public types
pub use cache::{CacheStats, DEFAULT_MAX_CACHED_STATEMENTS, GlobalStatementCache};
pub use error::{Error, Result};
pub use fingerprint::{Operator, QueryShape, ShapeFingerprint, placeholders};
pub use reader::{SingletonReadConnection, is_read_statement};
