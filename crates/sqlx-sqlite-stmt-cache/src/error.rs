//! Error types for sqlx-sqlite-stmt-cache

use thiserror::Error;

/// Errors that may occur when working with the shared read path
#[derive(Error, Debug)]
pub enum Error {
   /// Error from the connection layer (connectivity, broken connection,
   /// statement failures).
   #[error(transparent)]
   Pool(#[from] sqlx_sqlite_task_pool::Error),

   /// Only read-only statements may run on the shared read connection.
   #[error("statement is not read-only and cannot use the shared read connection: {0}")]
   NotReadOnly(String),
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
