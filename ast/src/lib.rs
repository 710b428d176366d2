#![forbid(unsafe_code)]
//! Read-only expression tree consumed by the query runtime.
//!
//! Trees are built with the constructor helpers on each node type. Nothing in here parses query
//! text; the runtime never mutates a tree it is given.
extern crate enquote;
extern crate phf;
extern crate regex;
extern crate serde;
extern crate strum;
extern crate strum_macros;
extern crate thiserror;

pub mod ast_error;
pub mod expr;
pub mod functions;
pub mod label;
pub mod operator;

pub mod prelude {
    pub use crate::ast_error::*;
    pub use crate::expr::*;
    pub use crate::functions::*;
    pub use crate::label::*;
    pub use crate::operator::*;
}
