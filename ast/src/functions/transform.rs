use std::fmt::{Display, Formatter};
use std::str::FromStr;

use phf::phf_map;
use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

use crate::ast_error::AstError;

/// Stateless functions applied point-wise to already materialized arguments.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, Serialize, Deserialize)]
pub enum TransformFunction {
    Abs,
    Ceil,
    ClampMax,
    ClampMin,
    End,
    Exp,
    Floor,
    Ln,
    Round,
    Scalar,
    Sqrt,
    Start,
    Step,
    Time,
    Union,
    Vector,
}

static FUNCTION_MAP: phf::Map<&'static str, TransformFunction> = phf_map! {
    "abs" => TransformFunction::Abs,
    "ceil" => TransformFunction::Ceil,
    "clamp_max" => TransformFunction::ClampMax,
    "clamp_min" => TransformFunction::ClampMin,
    "end" => TransformFunction::End,
    "exp" => TransformFunction::Exp,
    "floor" => TransformFunction::Floor,
    "ln" => TransformFunction::Ln,
    "round" => TransformFunction::Round,
    "scalar" => TransformFunction::Scalar,
    "sqrt" => TransformFunction::Sqrt,
    "start" => TransformFunction::Start,
    "step" => TransformFunction::Step,
    "time" => TransformFunction::Time,
    "union" => TransformFunction::Union,
    "vector" => TransformFunction::Vector,
};

impl TransformFunction {
    pub const fn name(&self) -> &'static str {
        use TransformFunction::*;
        match self {
            Abs => "abs",
            Ceil => "ceil",
            ClampMax => "clamp_max",
            ClampMin => "clamp_min",
            End => "end",
            Exp => "exp",
            Floor => "floor",
            Ln => "ln",
            Round => "round",
            Scalar => "scalar",
            Sqrt => "sqrt",
            Start => "start",
            Step => "step",
            Time => "time",
            Union => "union",
            Vector => "vector",
        }
    }

    pub const fn keep_metric_name(&self) -> bool {
        use TransformFunction::*;
        matches!(self, Union | Vector)
    }

    /// Functions which take no arguments and return a value derived from the evaluation range.
    pub const fn is_time_function(&self) -> bool {
        use TransformFunction::*;
        matches!(self, End | Start | Step | Time)
    }
}

impl Display for TransformFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for TransformFunction {
    type Err = AstError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FUNCTION_MAP
            .get(s)
            .or_else(|| FUNCTION_MAP.get(s.to_ascii_lowercase().as_str()))
            .copied()
            .ok_or_else(|| AstError::UnknownFunction(s.to_string()))
    }
}
