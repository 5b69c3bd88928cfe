use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    cache::{CatalogError, QueryError, StrategyError},
    config::LoadError,
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Flattened cause chain of an error, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit status for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) | AppError::Strategy(_) | AppError::Catalog(_) => 78,
            AppError::Validation(_) | AppError::Domain(_) => 65,
            AppError::Query(error) if error.is_transient() => 75,
            AppError::Infra(InfraError::Catalog { .. }) => 66,
            AppError::Infra(InfraError::Io(_)) => 74,
            AppError::Query(_)
            | AppError::Infra(_)
            | AppError::Unexpected(_) => 1,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_walks_the_cause_chain() {
        let io = std::io::Error::other("disk gone");
        let error = AppError::from(InfraError::from(io));
        let report = error.report();
        assert_eq!(report.messages[0], "io error: disk gone");
        assert_eq!(error.exit_code(), 74);
    }

    #[test]
    fn transient_query_errors_are_retryable_exits() {
        let error = AppError::from(QueryError::transient("timeout"));
        assert_eq!(error.exit_code(), 75);
        assert_eq!(AppError::validation("bad").exit_code(), 65);
    }
}
