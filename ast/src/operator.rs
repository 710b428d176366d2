use std::fmt;
use std::str::FromStr;

use phf::phf_map;
use serde::{Deserialize, Serialize};

use crate::ast_error::AstError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Add,
    And,
    Atan2,
    Default,
    Div,
    Eql,
    Mod,
    Mul,
    Pow,
    Sub,
    Gt,
    Gte,
    If,
    IfNot,
    Lt,
    Lte,
    NotEq,
    Or,
    Unless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Arithmetic,
    Comparison,
    Logical,
    Filter,
}

static BINARY_OPS_MAP: phf::Map<&'static str, Operator> = phf_map! {
    "+" => Operator::Add,
    "-" => Operator::Sub,
    "*" => Operator::Mul,
    "/" => Operator::Div,
    "%" => Operator::Mod,
    "^" => Operator::Pow,
    "atan2" => Operator::Atan2,

    "==" => Operator::Eql,
    "!=" => Operator::NotEq,
    "<" => Operator::Lt,
    ">" => Operator::Gt,
    "<=" => Operator::Lte,
    ">=" => Operator::Gte,

    "and" => Operator::And,
    "or" => Operator::Or,
    "unless" => Operator::Unless,

    "if" => Operator::If,
    "ifnot" => Operator::IfNot,
    "default" => Operator::Default,
};

impl Operator {
    pub const fn as_str(&self) -> &'static str {
        use Operator::*;
        match self {
            Add => "+",
            And => "and",
            Atan2 => "atan2",
            Default => "default",
            Div => "/",
            Eql => "==",
            Mod => "%",
            Mul => "*",
            Pow => "^",
            Sub => "-",
            Gt => ">",
            Gte => ">=",
            If => "if",
            IfNot => "ifnot",
            Lt => "<",
            Lte => "<=",
            NotEq => "!=",
            Or => "or",
            Unless => "unless",
        }
    }

    pub const fn kind(&self) -> OperatorKind {
        use Operator::*;
        match self {
            Add | Sub | Mul | Div | Mod | Pow | Atan2 => OperatorKind::Arithmetic,
            Eql | NotEq | Gt | Gte | Lt | Lte => OperatorKind::Comparison,
            And | Or | Unless => OperatorKind::Logical,
            If | IfNot | Default => OperatorKind::Filter,
        }
    }

    pub const fn is_comparison(&self) -> bool {
        matches!(self.kind(), OperatorKind::Comparison)
    }

    pub const fn is_logical_set(&self) -> bool {
        matches!(self.kind(), OperatorKind::Logical)
    }

    /// Operators whose result keeps the metric name of the left operand
    /// (unless a comparison is in `bool` mode).
    pub const fn keeps_metric_name(&self) -> bool {
        matches!(self, Operator::Default | Operator::If | Operator::IfNot) || self.is_comparison()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operator {
    type Err = AstError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BINARY_OPS_MAP
            .get(s)
            .or_else(|| BINARY_OPS_MAP.get(s.to_ascii_lowercase().as_str()))
            .copied()
            .ok_or_else(|| AstError::UnknownOperator(s.to_string()))
    }
}
