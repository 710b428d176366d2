mod binop_fns;
mod binop_handlers;

pub(crate) use binop_fns::*;
pub(crate) use binop_handlers::*;
