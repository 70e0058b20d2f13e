//! Error types for sqlx-sqlite-task-pool

use std::time::Duration;

use thiserror::Error;

/// Errors that may occur when working with sqlx-sqlite-task-pool
#[derive(Error, Debug)]
pub enum Error {
   /// Establishing a database session failed (bad path, permissions, or the
   /// file is not a database). Not retried automatically.
   #[error("failed to establish database connection: {0}")]
   Connectivity(#[source] sqlx::Error),

   /// No pooled connection became available within the acquisition timeout.
   /// Recoverable; the caller decides whether to retry or back off.
   #[error("connection pool exhausted after waiting {waited:?}")]
   PoolExhausted {
      /// How long the caller waited before giving up.
      waited: Duration,
   },

   /// The connection hit an unrecoverable error and must be discarded.
   #[error("connection is broken and cannot be used")]
   BrokenConnection,

   /// A transaction is already open on this physical connection.
   #[error("a transaction is already open on this connection")]
   TransactionAlreadyOpen,

   /// The pool has been closed and cannot hand out connections.
   #[error("pool has been closed")]
   PoolClosed,

   /// Error from the sqlx library. Statement preparation and execution
   /// failures are converted to this variant and propagated unchanged.
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
