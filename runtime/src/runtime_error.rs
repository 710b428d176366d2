use std::error::Error;
use std::fmt;
use std::fmt::Display;

use thiserror::Error;

use vmquery_ast::ast_error::AstError;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors a caller can act on. Broken internal invariants are not represented here; they panic.
#[derive(Debug, PartialEq, Clone, Error)]
pub enum RuntimeError {
    #[error("Argument error: {0}")]
    ArgumentError(String),
    #[error(transparent)]
    InvalidArgCount(ArgCountError),
    #[error("Unknown function `{0}`")]
    UnknownFunction(String),
    #[error("Expected number: found `{0}`")]
    InvalidNumber(String),
    #[error("Invalid regex: {0}")]
    InvalidRegex(String),
    #[error("duplicate time series on the {side} side of `{expr}`: {series}")]
    DuplicateTimeseries {
        side: &'static str,
        expr: String,
        series: String,
    },
    #[error("duplicate output timeseries: {0}")]
    DuplicateOutputTimeseries(String),
    #[error("not enough memory for processing {0}")]
    ResourcesExhausted(String),
    #[error("too many time series: {0}")]
    TooManyTimeseries(String),
    #[error("storage error: {0}")]
    StorageError(String),
    #[error("cannot return full response, since some of the storage nodes are unavailable: {0}")]
    PartialResponseDenied(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("deadline of {0} exceeded")]
    DeadlineExceeded(String),
    #[error("{0}")]
    General(String),
}

impl From<&str> for RuntimeError {
    fn from(message: &str) -> Self {
        RuntimeError::General(String::from(message))
    }
}

impl From<String> for RuntimeError {
    fn from(message: String) -> Self {
        RuntimeError::General(message)
    }
}

impl<E: Error + 'static> From<(String, E)> for RuntimeError {
    fn from((message, err): (String, E)) -> Self {
        RuntimeError::General(format!("{}: {}", message, err))
    }
}

impl<E: Error + 'static> From<(&str, E)> for RuntimeError {
    fn from((message, err): (&str, E)) -> Self {
        RuntimeError::General(format!("{}: {}", message, err))
    }
}

impl From<AstError> for RuntimeError {
    fn from(err: AstError) -> Self {
        match err {
            AstError::UnknownFunction(name) => RuntimeError::UnknownFunction(name),
            AstError::InvalidRegex(re, msg) => RuntimeError::InvalidRegex(format!("{re}: {msg}")),
            other => RuntimeError::General(other.to_string()),
        }
    }
}

/// Occurs when a function is called with the wrong number of arguments
#[derive(Debug, PartialEq, Clone, Error)]
pub struct ArgCountError {
    pos: Option<usize>,
    min: usize,
    max: usize,
    signature: String,
}

impl ArgCountError {
    /// Create a new instance of the error
    ///
    /// # Arguments
    /// * `signature` - Function call signature
    /// * `min` - Smallest allowed number of arguments
    /// * `max` - Largest allowed number of arguments
    pub fn new(signature: &str, min: usize, max: usize) -> Self {
        Self::new_with_index(None, signature, min, max)
    }

    pub fn new_with_index(pos: Option<usize>, signature: &str, min: usize, max: usize) -> Self {
        Self {
            pos,
            min,
            max,
            signature: signature.to_string(),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn pos(&self) -> Option<usize> {
        self.pos
    }
}

impl Display for ArgCountError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}: expected {} args", self.signature, self.min)?;
        } else if self.max == usize::MAX {
            write!(f, "{}: expected at least {} args", self.signature, self.min)?;
        } else {
            write!(f, "{}: expected {}-{} args", self.signature, self.min, self.max)?;
        }

        if let Some(pos) = self.pos {
            write!(f, " at position {}", pos)?;
        }

        Ok(())
    }
}

/// Checks that `args_len` is within `[min, max]`.
pub(crate) fn check_arg_count(
    signature: &str,
    args_len: usize,
    min: usize,
    max: usize,
) -> RuntimeResult<()> {
    if args_len < min || args_len > max {
        return Err(RuntimeError::InvalidArgCount(ArgCountError::new(
            signature, min, max,
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_count_message() {
        let err = RuntimeError::InvalidArgCount(ArgCountError::new("holt_winters", 3, 3));
        assert_eq!(err.to_string(), "holt_winters: expected 3 args");

        let err = ArgCountError::new_with_index(Some(2), "round", 1, 2);
        assert_eq!(err.to_string(), "round: expected 1-2 args at position 2");
    }

    #[test]
    fn tuple_conversion_formats_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: RuntimeError = ("cannot decode", cause).into();
        assert_eq!(err, RuntimeError::General("cannot decode: boom".to_string()));
    }

    #[test]
    fn check_arg_count_bounds() {
        assert!(check_arg_count("f", 2, 1, 3).is_ok());
        assert!(check_arg_count("f", 0, 1, 3).is_err());
        assert!(check_arg_count("f", 4, 1, 3).is_err());
    }
}
