//! Database error types.

use neurochron_core::Error as CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt job record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Rejected(#[from] CoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => CoreError::NotFound(what),
            DbError::Rejected(inner) => inner,
            DbError::Corrupt(msg) => CoreError::Internal(msg),
            DbError::Database(e) => CoreError::Unavailable(e.to_string()),
            DbError::Migration(e) => CoreError::Unavailable(e.to_string()),
        }
    }
}
