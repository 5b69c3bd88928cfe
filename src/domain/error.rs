use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("required field `{0}` is empty")]
    MissingField(&'static str),
    #[error("budget {0} is not a finite number")]
    InvalidBudget(f64),
    #[error("unknown promotion status `{0}`")]
    InvalidStatus(String),
}
