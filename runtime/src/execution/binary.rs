use tracing::{field, trace_span, Span};

use vmquery_ast::expr::BinaryExpr;

use crate::execution::eval::eval_expr;
use crate::execution::{Context, EvalConfig};
use crate::functions::binary::{exec_binop, BinaryOpFuncArg};
use crate::runtime_error::RuntimeResult;
use crate::types::Timeseries;

/// Evaluates both operands concurrently and applies the operator to the results.
pub(super) fn eval_binary_op(
    ctx: &Context,
    ec: &EvalConfig,
    be: &BinaryExpr,
) -> RuntimeResult<Vec<Timeseries>> {
    let span = if ec.trace_enabled() {
        trace_span!("binary_op", op = be.op.as_str(), series = field::Empty)
    } else {
        Span::none()
    }
    .entered();

    let (left, right) = eval_operands(ctx, ec, be)?;
    let mut bfa = BinaryOpFuncArg::new(left, be, right);
    let rv = exec_binop(&mut bfa)?;

    span.record("series", rv.len());
    Ok(rv)
}

fn eval_operands(
    ctx: &Context,
    ec: &EvalConfig,
    be: &BinaryExpr,
) -> RuntimeResult<(Vec<Timeseries>, Vec<Timeseries>)> {
    // Each side gets its own config, so the lazily built timestamps are never raced.
    let ec_left = ec.copy_no_timestamps();
    let ec_right = ec.copy_no_timestamps();
    match rayon::join(
        || eval_expr(ctx, &ec_left, &be.left),
        || eval_expr(ctx, &ec_right, &be.right),
    ) {
        (Ok(left), Ok(right)) => Ok((left, right)),
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
    }
}
