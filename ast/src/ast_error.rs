use thiserror::Error;

pub type AstResult<T> = Result<T, AstError>;

#[derive(Debug, PartialEq, Eq, Clone, Error)]
pub enum AstError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("invalid regex {0}: {1}")]
    InvalidRegex(String, String),
    #[error("{0}")]
    General(String),
}
