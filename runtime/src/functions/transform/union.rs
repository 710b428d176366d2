use vmquery_common::hash::FastHashSet;

use crate::execution::eval_number;
use crate::runtime_error::{check_arg_count, RuntimeResult};
use crate::types::{QueryValue, Timeseries};

use super::TransformFuncArg;

/// Concatenates the args, keeping only the first series seen for each metric name.
pub(crate) fn transform_union(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    if tfa.args.is_empty() {
        return eval_number(tfa.ec, f64::NAN);
    }

    let mut args = Vec::with_capacity(tfa.args.len());
    for i in 0..tfa.args.len() {
        args.push(tfa.take_series(i)?);
    }

    // `(1, 2, 3)` returns every scalar, so `q1 or q2` style fallbacks over scalars work.
    if args.iter().all(|arg| is_scalar_series(arg)) {
        return Ok(args.into_iter().flatten().collect());
    }

    let len = args[0].len();
    let mut rvs: Vec<Timeseries> = Vec::with_capacity(len);
    let mut seen = FastHashSet::default();
    for arg in args.into_iter() {
        for ts in arg.into_iter() {
            if seen.insert(ts.metric_name.signature()) {
                rvs.push(ts);
            }
        }
    }

    Ok(rvs)
}

fn is_scalar_series(tss: &[Timeseries]) -> bool {
    tss.len() == 1 && tss[0].metric_name.is_empty()
}

/// `scalar(x)`: the single series of `x` with its name dropped, or NaN when `x` holds zero or
/// several series. A string arg is parsed as a number.
pub(crate) fn transform_scalar(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    check_arg_count("scalar", tfa.args.len(), 1, 1)?;
    if let QueryValue::String(s) = &tfa.args[0] {
        let n = s.trim().parse::<f64>().unwrap_or(f64::NAN);
        return eval_number(tfa.ec, n);
    }
    let mut series = tfa.take_series(0)?;
    if series.len() != 1 {
        return eval_number(tfa.ec, f64::NAN);
    }
    series[0].metric_name.reset();
    Ok(series)
}

pub(crate) fn transform_vector(tfa: &mut TransformFuncArg) -> RuntimeResult<Vec<Timeseries>> {
    check_arg_count("vector", tfa.args.len(), 1, 1)?;
    tfa.take_series(0)
}
