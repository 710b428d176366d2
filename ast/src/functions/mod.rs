use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use aggregate::*;
pub use rollup::*;
pub use transform::*;

use crate::ast_error::{AstError, AstResult};

mod aggregate;
mod rollup;
mod transform;

/// A function referenced by name from a call node. Aggregates show up here only when they are
/// written as plain calls (without a modifier); the usual route for them is `AggregationExpr`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinFunction {
    Aggregate(AggregateFunction),
    Rollup(RollupFunction),
    Transform(TransformFunction),
}

impl BuiltinFunction {
    pub fn new(name: &str) -> AstResult<Self> {
        if let Ok(rf) = RollupFunction::from_str(name) {
            return Ok(BuiltinFunction::Rollup(rf));
        }
        if let Ok(tf) = TransformFunction::from_str(name) {
            return Ok(BuiltinFunction::Transform(tf));
        }
        if let Ok(af) = AggregateFunction::from_str(name) {
            return Ok(BuiltinFunction::Aggregate(af));
        }
        Err(AstError::UnknownFunction(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinFunction::Aggregate(af) => af.name(),
            BuiltinFunction::Rollup(rf) => rf.name(),
            BuiltinFunction::Transform(tf) => tf.name(),
        }
    }

    pub fn is_rollup(&self) -> bool {
        matches!(self, BuiltinFunction::Rollup(_))
    }
}

impl Display for BuiltinFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
