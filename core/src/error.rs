//! Error taxonomy shared by the store, the service facade and the HTTP layer.

use rusqlite::{ErrorCode, ffi};

use crate::models::EntityType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Row missing or owned by someone else. The two cases are deliberately
    /// indistinguishable to the caller.
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityType, id: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Another request holds the exclusive completion lock for this list.
    #[error("shopping list {list_id} is locked by a concurrent completion")]
    LockContended { list_id: String },

    #[error("{operation} aborted and rolled back: {source}")]
    TransactionAborted {
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("operation exceeded its deadline")]
    Timeout,

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("malformed stored data: {0}")]
    Decode(String),

    #[error("store error: {0}")]
    Store(rusqlite::Error),
}

impl Error {
    pub fn not_found(entity: EntityType, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Wrap a failure that happened inside a multi-step transaction.
    ///
    /// Only store and decode failures are rewrapped; every other class already
    /// tells the caller what to do and passes through unchanged.
    #[must_use]
    pub fn aborted(operation: &'static str, source: Error) -> Self {
        match source {
            Self::Store(_) | Self::Decode(_) => Self::TransactionAborted {
                operation,
                source: Box::new(source),
            },
            other => other,
        }
    }

    /// Conflict-class errors signal that a concurrent writer got there first.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::LockContended { .. })
    }

    /// Whether the caller may simply try again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::LockContended { .. } | Self::TransactionAborted { .. }
        )
    }

    /// Stable machine-readable code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::LockContended { .. } => "LOCK_CONTENDED",
            Self::TransactionAborted { .. } => "TRANSACTION_ABORTED",
            Self::Timeout => "TIMEOUT",
            Self::Invalid(_) => "INVALID",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        let classified = match &err {
            rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::OperationInterrupted => Some(Self::Timeout),
                ErrorCode::ConstraintViolation
                    if matches!(
                        failure.extended_code,
                        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    ) =>
                {
                    Some(Self::AlreadyExists(
                        message
                            .clone()
                            .unwrap_or_else(|| "unique constraint violated".to_string()),
                    ))
                }
                _ => None,
            },
            rusqlite::Error::FromSqlConversionFailure(column, _, inner) => {
                Some(Self::Decode(format!("column {column}: {inner}")))
            }
            rusqlite::Error::InvalidColumnType(column, name, ty) => Some(Self::Decode(format!(
                "column {column} ({name}) has unexpected type {ty}"
            ))),
            _ => None,
        };
        match classified {
            Some(error) => error,
            None => Self::Store(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_maps_to_timeout() {
        let err = Error::from(sqlite_failure(ffi::SQLITE_BUSY));
        assert!(matches!(err, Error::Timeout));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_interrupt_maps_to_timeout() {
        let err = Error::from(sqlite_failure(ffi::SQLITE_INTERRUPT));
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn test_unique_violation_maps_to_already_exists() {
        let err = Error::from(sqlite_failure(ffi::SQLITE_CONSTRAINT_UNIQUE));
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(err.code(), "ALREADY_EXISTS");
    }

    #[test]
    fn test_other_constraint_is_store_error() {
        let err = Error::from(sqlite_failure(ffi::SQLITE_CONSTRAINT_CHECK));
        assert!(matches!(err, Error::Store(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_aborted_keeps_timeout_class() {
        let err = Error::aborted("complete", Error::Timeout);
        assert!(matches!(err, Error::Timeout));

        let err = Error::aborted("complete", Error::Decode("bad".into()));
        assert!(matches!(err, Error::TransactionAborted { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_lock_contention_is_conflict_class() {
        let err = Error::LockContended {
            list_id: "l1".into(),
        };
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert_eq!(err.code(), "LOCK_CONTENDED");
    }
}
