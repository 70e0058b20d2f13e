/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the database facade.
///
/// Callers can distinguish "try again later" (pool exhaustion) from "this
/// request is invalid/failed" (statement errors) from "the database is
/// unreachable" (connectivity) via the wrapped variants and
/// [`error_code`](Error::error_code).
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the connection pool layer.
   #[error(transparent)]
   Pool(#[from] sqlx_sqlite_task_pool::Error),

   /// Error from the shared read path.
   #[error(transparent)]
   ReadPath(#[from] sqlx_sqlite_stmt_cache::Error),

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// A transaction is already open for this task; nested transactions are
   /// unsupported, never silently flattened.
   #[error("a transaction is already open for task {0}")]
   TransactionConflict(crate::TaskId),

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// Table or column name contains invalid characters.
   ///
   /// Identifiers must match `[a-zA-Z_][a-zA-Z0-9_.]*` (letters, digits,
   /// underscores, and dots for qualified names like `table.column`).
   #[error("invalid identifier '{0}': must match [a-zA-Z_][a-zA-Z0-9_.]*")]
   InvalidIdentifier(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Pool(inner) => pool_error_code(inner),
         Error::ReadPath(sqlx_sqlite_stmt_cache::Error::Pool(inner)) => pool_error_code(inner),
         Error::ReadPath(sqlx_sqlite_stmt_cache::Error::NotReadOnly(_)) => {
            "NOT_READ_ONLY".to_string()
         }
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::TransactionConflict(_) => "TRANSACTION_CONFLICT".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::InvalidIdentifier(_) => "INVALID_IDENTIFIER".to_string(),
      }
   }
}

/// Code for errors surfaced from the connection layer. Shared by the pool
/// and read-path wrappers so a SQLite code survives either route.
fn pool_error_code(inner: &sqlx_sqlite_task_pool::Error) -> String {
   use sqlx_sqlite_task_pool::Error as PoolError;

   match inner {
      PoolError::Connectivity(_) => "CONNECTIVITY_ERROR".to_string(),
      PoolError::PoolExhausted { .. } => "POOL_EXHAUSTED".to_string(),
      PoolError::BrokenConnection => "BROKEN_CONNECTION".to_string(),
      PoolError::TransactionAlreadyOpen => "TRANSACTION_ALREADY_OPEN".to_string(),
      PoolError::PoolClosed => "POOL_CLOSED".to_string(),
      PoolError::Sqlx(e) => {
         if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
            return format!("SQLITE_{}", code);
         }
         "SQLX_ERROR".to_string()
      }
      PoolError::Io(_) => "IO_ERROR".to_string(),
   }
}
