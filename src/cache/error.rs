use thiserror::Error;

use super::entities::CatalogError;
use crate::application::datastore::DatastoreError;

/// Errors surfaced by cache reads and writes.
///
/// `Clone` because one in-flight load may be awaited by several callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("backend request failed: {message}")]
    Transient { message: String },
    #[error("`{entity}` record {} does not exist", id.as_deref().unwrap_or("<unknown>"))]
    NotFound { entity: String, id: Option<String> },
    #[error("write conflicts with unique constraint `{constraint}`")]
    Conflict { constraint: String },
    #[error("request rejected by backend: {message}")]
    Rejected { message: String },
    #[error("payload could not be decoded: {message}")]
    Decode { message: String },
    #[error("query was cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: Some(id.into()),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Only transient failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// A detail lookup that found nothing.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<DatastoreError> for QueryError {
    fn from(error: DatastoreError) -> Self {
        match error {
            DatastoreError::Persistence(message) | DatastoreError::Unavailable(message) => {
                Self::Transient { message }
            }
            DatastoreError::Timeout => Self::transient("datastore timeout"),
            DatastoreError::Duplicate { constraint } => Self::Conflict { constraint },
            DatastoreError::NotFound { table } => Self::NotFound {
                entity: table,
                id: None,
            },
            DatastoreError::InvalidInput { message } => Self::Rejected { message },
        }
    }
}

impl From<CatalogError> for QueryError {
    fn from(error: CatalogError) -> Self {
        Self::Rejected {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(error: serde_json::Error) -> Self {
        Self::decode(error.to_string())
    }
}
