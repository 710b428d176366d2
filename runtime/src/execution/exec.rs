use std::sync::Arc;

use tracing::{debug, field, trace_span, Span};

use vmquery_ast::expr::Expr;
use vmquery_ast::functions::BuiltinFunction;
use vmquery_common::hash::FastHashSet;

use crate::common::math::round_to_decimal_digits;
use crate::execution::eval::eval_expr;
use crate::execution::{adjust_start_end, Context, EvalConfig};
use crate::runtime_error::{RuntimeError, RuntimeResult};
use crate::types::{Timeseries, Timestamp};

/// Evaluates `expr` for `ec` and prepares the result for returning to a caller: all-NaN series
/// are removed, duplicate identities rejected, series sorted by identity unless the top-level
/// aggregate defines its own order, and values rounded to `ec.round_digits`.
///
/// With `is_first_point_only` only the first point of every series is kept, which is what
/// instant queries need.
pub fn exec(
    ctx: &Context,
    ec: &EvalConfig,
    expr: &Expr,
    is_first_point_only: bool,
) -> RuntimeResult<Vec<Timeseries>> {
    ec.validate()?;

    let span = if ec.trace_enabled() {
        trace_span!(
            "eval",
            expr = %expr,
            may_cache = ec.may_cache(),
            start = ec.start,
            end = ec.end,
            step = ec.step,
            series = field::Empty,
            points = field::Empty
        )
    } else {
        Span::none()
    }
    .entered();

    let mut rv = eval_expr(ctx, ec, expr)?;
    if is_first_point_only {
        keep_first_point(&mut rv);
    }
    rv.retain(|ts| !ts.is_all_nans());
    check_duplicate_output(&rv)?;

    let may_sort = may_sort_results(expr);
    if may_sort {
        rv.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
    }

    if ec.round_digits < 100 {
        let digits = ec.round_digits as i32;
        for ts in rv.iter_mut() {
            for v in ts.values.iter_mut() {
                *v = round_to_decimal_digits(*v, digits);
            }
        }
    }

    let points: usize = rv.iter().map(|ts| ts.values.len()).sum();
    span.record("series", rv.len());
    span.record("points", points);
    debug!(
        series = rv.len(),
        sorted = may_sort,
        partial = ec.is_partial_response(),
        "evaluated {expr}"
    );
    Ok(rv)
}

/// Builds a config for the range `[start, end]` from the settings of `ctx`. Start and end are
/// aligned to `step` when the cache is enabled, so sliding ranges reuse cached results.
pub fn new_eval_config(
    ctx: &Context,
    start: Timestamp,
    end: Timestamp,
    step: i64,
) -> RuntimeResult<EvalConfig> {
    let mut ec = EvalConfig::from(ctx);
    ec.start = start;
    ec.end = end;
    ec.step = step;
    ec.validate()?;
    if !ctx.config.disable_cache {
        (ec.start, ec.end) = adjust_start_end(start, end, step);
        ec.set_caching(true);
    }
    Ok(ec)
}

/// Evaluates `expr` over `[start, end]` with the settings of `ctx`.
pub fn query_range(
    ctx: &Context,
    expr: &Expr,
    start: Timestamp,
    end: Timestamp,
    step: i64,
) -> RuntimeResult<Vec<Timeseries>> {
    let ec = new_eval_config(ctx, start, end, step)?;
    exec(ctx, &ec, expr, false)
}

fn keep_first_point(tss: &mut [Timeseries]) {
    let Some(first) = tss.first().and_then(|ts| ts.timestamps.first().copied()) else {
        return;
    };
    let timestamps = Arc::new(vec![first]);
    for ts in tss.iter_mut() {
        ts.values.truncate(1);
        ts.timestamps = Arc::clone(&timestamps);
    }
}

fn check_duplicate_output(tss: &[Timeseries]) -> RuntimeResult<()> {
    let mut seen = FastHashSet::default();
    seen.reserve(tss.len());
    for ts in tss {
        if !seen.insert(ts.metric_name.signature()) {
            return Err(RuntimeError::DuplicateOutputTimeseries(
                ts.metric_name.to_string(),
            ));
        }
    }
    Ok(())
}

/// `topk` and friends return series in their own order.
fn may_sort_results(expr: &Expr) -> bool {
    match expr {
        Expr::Aggregation(ae) => !ae.function.keeps_own_order(),
        Expr::Function(fe) => match fe.function {
            BuiltinFunction::Aggregate(af) => !af.keeps_own_order(),
            _ => true,
        },
        _ => true,
    }
}
