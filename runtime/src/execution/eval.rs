use tracing::{field, trace_span, Span};

use vmquery_ast::expr::{AggregationExpr, Expr, FunctionExpr, RollupExpr};
use vmquery_ast::functions::{BuiltinFunction, RollupFunction, TransformFunction};

use crate::execution::binary::eval_binary_op;
use crate::execution::rollup::RollupEvaluator;
use crate::execution::{eval_number, Context, EvalConfig};
use crate::functions::aggregate::{
    get_aggr_func, AggrFuncArg, IncrementalAggrFuncContext, IncrementalAggregationHandler,
};
use crate::functions::transform::{get_transform_func, TransformFuncArg};
use crate::provider::worker_count;
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::{QueryValue, Timeseries};

/// Evaluates `expr` over the time range of `ec`.
///
/// The tree is never modified. User errors are returned; broken invariants panic.
pub fn eval_expr(ctx: &Context, ec: &EvalConfig, expr: &Expr) -> RuntimeResult<Vec<Timeseries>> {
    match expr {
        Expr::Number(n) => eval_number(ec, *n),
        Expr::Duration(d) => eval_number(ec, d.value(ec.step) as f64 / 1e3),
        Expr::StringLiteral(s) => eval_string(ec, s),
        Expr::MetricExpression(_) => {
            // Bare selectors are evaluated as default_rollup(selector).
            let fe = FunctionExpr::default_rollup(expr.clone());
            eval_rollup_func(ctx, ec, &fe, &Expr::Function(fe.clone()), None)
        }
        Expr::Rollup(_) => {
            let fe = FunctionExpr::default_rollup(expr.clone());
            eval_rollup_func(ctx, ec, &fe, &Expr::Function(fe.clone()), None)
        }
        Expr::Function(fe) => match fe.function {
            BuiltinFunction::Rollup(_) => eval_rollup_func(ctx, ec, fe, expr, None),
            BuiltinFunction::Transform(tf) => eval_transform_func(ctx, ec, fe, tf),
            BuiltinFunction::Aggregate(af) => {
                // `sum(x)` written as a call carries no modifier or limit.
                let ae = AggregationExpr::new(af, fe.args.clone());
                eval_aggr_func(ctx, ec, &ae)
            }
        },
        Expr::Aggregation(ae) => eval_aggr_func(ctx, ec, ae),
        Expr::BinaryOperator(be) => eval_binary_op(ctx, ec, be),
    }
}

pub(super) fn eval_string(ec: &EvalConfig, s: &str) -> RuntimeResult<Vec<Timeseries>> {
    let mut rv = eval_number(ec, f64::NAN)?;
    rv[0].metric_name.set_metric_group(s);
    Ok(rv)
}

/// Evaluates a function argument. Literals stay literals so functions can tell a scalar or a
/// string apart from a series.
pub(super) fn eval_arg(ctx: &Context, ec: &EvalConfig, arg: &Expr) -> RuntimeResult<QueryValue> {
    let value = match arg {
        Expr::StringLiteral(s) => QueryValue::String(s.clone()),
        Expr::Number(n) => QueryValue::Scalar(*n),
        Expr::Duration(d) => QueryValue::Scalar(d.value(ec.step) as f64 / 1e3),
        _ => QueryValue::InstantVector(eval_expr(ctx, ec, arg)?),
    };
    Ok(value)
}

fn eval_args(ctx: &Context, ec: &EvalConfig, args: &[Expr]) -> RuntimeResult<Vec<QueryValue>> {
    args.iter().map(|arg| eval_arg(ctx, ec, arg)).collect()
}

fn eval_transform_func(
    ctx: &Context,
    ec: &EvalConfig,
    fe: &FunctionExpr,
    tf: TransformFunction,
) -> RuntimeResult<Vec<Timeseries>> {
    let args = eval_args(ctx, ec, &fe.args)?;
    let keep_metric_names = fe.keep_metric_names || tf.keep_metric_name();
    let mut tfa = TransformFuncArg::new(ec, args, keep_metric_names);
    let handler = get_transform_func(tf);
    handler(&mut tfa).map_err(|err| match err {
        RuntimeError::General(msg) => RuntimeError::General(format!("cannot evaluate {fe}: {msg}")),
        other => other,
    })
}

fn eval_aggr_func(
    ctx: &Context,
    ec: &EvalConfig,
    ae: &AggregationExpr,
) -> RuntimeResult<Vec<Timeseries>> {
    let span = if ec.trace_enabled() {
        trace_span!("aggregate", name = ae.name(), incremental = field::Empty, series = field::Empty)
    } else {
        Span::none()
    }
    .entered();

    if IncrementalAggregationHandler::handles(ae.function) {
        if let Some(fe) = try_get_arg_rollup_func_with_metric_expr(ae) {
            // Aggregate the rollup results as they are produced, so only a handful of series
            // per worker have to be held in memory.
            span.record("incremental", true);
            let iafc = IncrementalAggrFuncContext::new(ae, worker_count())?;
            let expr = Expr::Aggregation(ae.clone());
            let rv = eval_rollup_func(ctx, ec, &fe, &expr, Some(&iafc))?;
            span.record("series", rv.len());
            return Ok(rv);
        }
    }

    let args = eval_args(ctx, ec, &ae.args)?;
    let mut afa = AggrFuncArg::new(ec, args, &ae.modifier, ae.limit);
    let handler = get_aggr_func(ae.function);
    let rv = handler(&mut afa)?;
    span.record("series", rv.len());
    Ok(rv)
}

/// Returns the rollup call to evaluate when `ae` is one of
///
/// * `aggr(selector)`
/// * `aggr(selector[d])`
/// * `aggr(rollup_func(selector))`
/// * `aggr(rollup_func(selector[d]))`
///
/// Subqueries and empty selectors don't qualify.
fn try_get_arg_rollup_func_with_metric_expr(ae: &AggregationExpr) -> Option<FunctionExpr> {
    if ae.args.len() != 1 {
        return None;
    }

    fn is_plain_selector(e: &Expr) -> bool {
        match e {
            Expr::MetricExpression(me) => !me.is_empty(),
            Expr::Rollup(re) => {
                matches!(&*re.expr, Expr::MetricExpression(me) if !me.is_empty())
                    && !re.for_subquery()
            }
            _ => false,
        }
    }

    let arg = &ae.args[0];
    match arg {
        Expr::MetricExpression(_) | Expr::Rollup(_) if is_plain_selector(arg) => {
            Some(FunctionExpr::default_rollup(arg.clone()))
        }
        Expr::Function(fe) => {
            let rf = fe.rollup_function()?;
            let idx = rf.rollup_arg_idx(fe.args.len());
            match fe.args.get(idx) {
                Some(series) if is_plain_selector(series) => Some(fe.clone()),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Evaluates the rollup function call `fe`. `expr` is the expression the results are cached
/// under: `fe` itself, or the aggregate wrapping it when `iafc` is set.
pub(super) fn eval_rollup_func(
    ctx: &Context,
    ec: &EvalConfig,
    fe: &FunctionExpr,
    expr: &Expr,
    iafc: Option<&IncrementalAggrFuncContext>,
) -> RuntimeResult<Vec<Timeseries>> {
    let func = fe.rollup_function().unwrap_or_else(|| {
        panic!("BUG: {} is not a rollup function", fe.name);
    });
    let idx = func.rollup_arg_idx(fe.args.len());
    if fe.args.len() <= idx {
        return Err(RuntimeError::ArgumentError(format!(
            "expecting at least {} args to {}; got {} args; expr: {fe}",
            idx + 1,
            fe.name,
            fe.args.len()
        )));
    }

    let mut args = Vec::with_capacity(fe.args.len());
    for (i, arg) in fe.args.iter().enumerate() {
        if i == idx {
            // The series are fetched by the rollup evaluator itself.
            args.push(QueryValue::nan());
            continue;
        }
        args.push(eval_arg(ctx, ec, arg)?);
    }

    let re = get_rollup_expr_arg(&fe.args[idx]);
    let keep_metric_names = get_keep_metric_names(expr, func);
    let evaluator = RollupEvaluator::new(func, expr, &re, args, keep_metric_names, iafc);
    evaluator.eval(ctx, ec)
}

/// Wraps a non-rollup argument into a rollup and rewrites `selector[d:s]` subqueries into
/// `default_rollup(selector)[d:s]`.
fn get_rollup_expr_arg(arg: &Expr) -> RollupExpr {
    let mut re = match arg {
        Expr::Rollup(re) => re.clone(),
        _ => RollupExpr::new(arg.clone()),
    };
    if !re.for_subquery() {
        return re;
    }
    if let Expr::MetricExpression(_) = &*re.expr {
        let inner = Expr::Rollup(RollupExpr::new((*re.expr).clone()));
        re.expr = Box::new(Expr::Function(FunctionExpr::default_rollup(inner)));
    }
    re
}

fn get_keep_metric_names(expr: &Expr, func: RollupFunction) -> bool {
    if func.keep_metric_name() {
        return true;
    }
    match expr {
        Expr::Aggregation(ae) => ae.keep_metric_names,
        Expr::Function(fe) => fe.keep_metric_names,
        _ => false,
    }
}
